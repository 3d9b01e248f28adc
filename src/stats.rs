use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};

static TX_BYTES: AtomicU64 = AtomicU64::new(0);
static RX_BYTES: AtomicU64 = AtomicU64::new(0);
static REPORT_INTERVAL_SECS: AtomicU64 = AtomicU64::new(10);

static LAST_REPORT: LazyLock<Mutex<std::time::Instant>> = LazyLock::new(|| Mutex::new(std::time::Instant::now()));

pub fn set_report_interval(secs: u64) {
    if secs > 0 {
        REPORT_INTERVAL_SECS.store(secs, Ordering::Relaxed);
    }
}

/// Adds to the global byte meters and periodically logs a summary line.
pub fn traffic_update(delta_tx: usize, delta_rx: usize) {
    let tx = TX_BYTES.fetch_add(delta_tx as u64, Ordering::Relaxed) + delta_tx as u64;
    let rx = RX_BYTES.fetch_add(delta_rx as u64, Ordering::Relaxed) + delta_rx as u64;

    let interval = REPORT_INTERVAL_SECS.load(Ordering::Relaxed);
    let mut last = LAST_REPORT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if last.elapsed().as_secs() >= interval {
        *last = std::time::Instant::now();
        log::debug!("traffic: ▲ {tx} : ▼ {rx}");
    }
}

pub fn totals() -> (u64, u64) {
    (TX_BYTES.load(Ordering::Relaxed), RX_BYTES.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate() {
        let (tx0, rx0) = totals();
        traffic_update(10, 20);
        traffic_update(5, 0);
        let (tx, rx) = totals();
        assert_eq!(tx - tx0, 15);
        assert_eq!(rx - rx0, 20);
    }
}
