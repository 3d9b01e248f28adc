use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only, file-backed payload log; one instance per session. Records
/// are tagged with the side they were captured on. Failures to write are
/// logged and never fatal to the relay.
pub struct TrafficLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

impl TrafficLog {
    pub fn new(dir: &Path, prefix: &str, suffix: &str, session_label: &str) -> Self {
        let file_name = format!("{}{}.{}", prefix, sanitize(session_label), suffix);
        Self {
            path: dir.join(file_name),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&mut self) -> std::io::Result<&mut BufWriter<File>> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.writer = Some(BufWriter::new(file));
        }
        Ok(self.writer.as_mut().unwrap())
    }

    fn header(side: char, len: usize) -> String {
        let now = chrono::Local::now();
        format!("[{} {}] {} bytes\n", now.format("%Y-%m-%d %H:%M:%S%.6f"), side, len)
    }

    /// Appends one captured payload record for the given side.
    pub fn write(&mut self, side: char, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let header = Self::header(side, payload.len());
        let result = self.ensure_open().and_then(|w| {
            w.write_all(header.as_bytes())?;
            w.write_all(payload)?;
            w.write_all(b"\n")
        });
        if let Err(err) = result {
            log::error!("traffic log write failed for {}: {}", self.path.display(), err);
        }
    }

    pub fn write_text(&mut self, side: char, text: &str) {
        self.write(side, text.as_bytes());
    }

    pub fn left_write(&mut self, text: &str) {
        self.write_text('L', text);
    }

    pub fn right_write(&mut self, text: &str) {
        self.write_text('R', text);
    }
}

impl Drop for TrafficLog {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.flush() {
                log::error!("traffic log flush failed for {}: {}", self.path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_side_tagged() {
        let dir = std::env::temp_dir().join(format!("traflog-test-{}", std::process::id()));
        let mut tlog = TrafficLog::new(&dir, "cap-", "smcap", "session:1");
        tlog.write('L', b"request payload");
        tlog.right_write("Server side connection closed\n");
        tlog.left_write("Connection stop\n");
        drop(tlog);

        let path = dir.join("cap-session_1.smcap");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("request payload"));
        assert!(contents.contains("Server side connection closed"));
        assert!(contents.contains("Connection stop"));
        assert!(contents.contains(" L] "));
        assert!(contents.contains(" R] "));
        std::fs::remove_dir_all(&dir).ok();
    }
}
