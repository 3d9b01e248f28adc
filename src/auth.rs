use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

/// Identity resolved for a source IP, fed from an external logon store.
#[derive(Debug, Clone, Default)]
pub struct IdentityRecord {
    pub ip: String,
    pub username: String,
    pub groups: Vec<String>,
    pub logon_at: Option<SystemTime>,
    pub last_seen: Option<SystemTime>,
    pub last_policy: Option<String>,
}

impl IdentityRecord {
    pub fn new(ip: &str, username: &str, groups: &[&str]) -> Self {
        Self {
            ip: ip.to_string(),
            username: username.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            logon_at: Some(SystemTime::now()),
            last_seen: Some(SystemTime::now()),
            last_policy: None,
        }
    }

    fn idle_for(&self, now: SystemTime) -> Duration {
        self.last_seen
            .and_then(|seen| now.duration_since(seen).ok())
            .unwrap_or_default()
    }
}

/// Snapshot of the external authentication table, keyed by source IP string.
/// Refreshed wholesale; readers take short scoped locks.
pub struct AuthTable {
    idle_timeout: Duration,
    inner: RwLock<HashMap<String, IdentityRecord>>,
}

impl AuthTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Merges a fresh snapshot: existing entries are updated in place, new
    /// ones inserted. An empty snapshot flushes the whole table, mirroring
    /// the upstream store reporting zero logons.
    pub fn refresh(&self, snapshot: Vec<IdentityRecord>) {
        let mut map = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if snapshot.is_empty() {
            if !map.is_empty() {
                log::debug!("auth table refresh: zero sized snapshot, flushing {} identities", map.len());
                map.clear();
            }
            return;
        }
        for record in snapshot {
            match map.get_mut(&record.ip) {
                Some(existing) => {
                    log::debug!("auth table refresh: updating identity {}", record.ip);
                    existing.username = record.username;
                    existing.groups = record.groups;
                    existing.logon_at = record.logon_at;
                }
                None => {
                    log::info!(
                        "auth table refresh: new identity ip: {}, username: {}, groups: {}",
                        record.ip,
                        record.username,
                        record.groups.join("+")
                    );
                    map.insert(record.ip.clone(), record);
                }
            }
        }
    }

    pub fn get(&self, ip: &str) -> Option<IdentityRecord> {
        let map = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.get(ip).cloned()
    }

    /// Marks the identity as recently active.
    pub fn touch(&self, ip: &str) {
        let mut map = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(record) = map.get_mut(ip) {
            record.last_seen = Some(SystemTime::now());
        }
    }

    pub fn set_last_policy(&self, ip: &str, tag: &str) {
        let mut map = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(record) = map.get_mut(ip) {
            record.last_policy = Some(tag.to_string());
        }
    }

    pub fn remove(&self, ip: &str) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.remove(ip).is_some()
    }

    /// Evicts identities idle beyond the configured timeout, returning how
    /// many were removed.
    pub fn timeout_check(&self) -> usize {
        let now = SystemTime::now();
        let mut map = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let expired: Vec<String> = map
            .values()
            .filter(|record| record.idle_for(now) > self.idle_timeout)
            .map(|record| record.ip.clone())
            .collect();
        for ip in &expired {
            map.remove(ip);
            log::info!("identity for {} timed out", ip);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_merges_and_flushes() {
        let table = AuthTable::new(Duration::from_secs(600));
        table.refresh(vec![
            IdentityRecord::new("10.0.0.1", "alice", &["staff"]),
            IdentityRecord::new("10.0.0.2", "bob", &["ops", "staff"]),
        ]);
        assert_eq!(table.len(), 2);

        // update keeps the entry, changes the username
        table.refresh(vec![IdentityRecord::new("10.0.0.1", "alice2", &["staff"])]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("10.0.0.1").unwrap().username, "alice2");

        // empty snapshot flushes everything
        table.refresh(Vec::new());
        assert!(table.is_empty());
    }

    #[test]
    fn timeout_check_removes_idle_only() {
        let table = AuthTable::new(Duration::from_secs(300));
        let mut idle = IdentityRecord::new("10.0.0.1", "idle", &[]);
        idle.last_seen = SystemTime::now().checked_sub(Duration::from_secs(3600));
        let fresh = IdentityRecord::new("10.0.0.2", "fresh", &[]);
        table.refresh(vec![idle, fresh]);

        assert_eq!(table.timeout_check(), 1);
        assert!(table.get("10.0.0.1").is_none());
        assert!(table.get("10.0.0.2").is_some());
    }

    #[test]
    fn last_policy_tag_is_recorded() {
        let table = AuthTable::new(Duration::from_secs(600));
        table.refresh(vec![IdentityRecord::new("10.0.0.9", "carol", &[])]);
        table.set_last_policy("10.0.0.9", "allow-all");
        assert_eq!(table.get("10.0.0.9").unwrap().last_policy.as_deref(), Some("allow-all"));
    }
}
