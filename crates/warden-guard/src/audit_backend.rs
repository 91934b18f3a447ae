//! Pluggable storage for audit events.
//!
//! # File Backend Format
//!
//! One JSON-serialized [`AuditEvent`] per line. Events carry their own HMAC
//! signature and chain hash, so no per-line framing is needed:
//!
//! ```text
//! {"sequence":1,"id":"...","timestamp":"...","actor":{...},...,"prev_hash":null}
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::audit::AuditEvent;
use crate::error::AuditError;

/// Storage for audit events.
///
/// Calls are serialized by the logger's write lock, so implementations need
/// no synchronization of their own.
pub trait AuditBackend: Send + Sync + std::fmt::Debug {
    /// Durably append one event. On error nothing may be visible to readers.
    fn append(&mut self, event: &AuditEvent) -> Result<(), AuditError>;

    /// Load every stored event in append order.
    fn load_all(&self) -> Result<Vec<AuditEvent>, AuditError>;

    /// Number of stored events.
    fn count(&self) -> Result<usize, AuditError>;

    /// Remove the leading run of events timestamped before `cutoff`.
    ///
    /// This is the retention path; normal operation never removes events.
    fn remove_prefix_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize, AuditError>;
}

fn expired_prefix(events: &[AuditEvent], cutoff: DateTime<Utc>) -> usize {
    events.iter().take_while(|e| e.timestamp < cutoff).count()
}

/// Volatile in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryAuditBackend {
    events: Vec<AuditEvent>,
}

impl AuditBackend for MemoryAuditBackend {
    fn append(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.push(event.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self.events.clone())
    }

    fn count(&self) -> Result<usize, AuditError> {
        Ok(self.events.len())
    }

    fn remove_prefix_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let n = expired_prefix(&self.events, cutoff);
        self.events.drain(..n);
        Ok(n)
    }
}

/// Append-only JSONL file backend.
///
/// Each event is written as a single `write_all` of one line and flushed
/// before `append` returns.
#[derive(Debug)]
pub struct FileAuditBackend {
    path: PathBuf,
    /// Open handle for appending (None until first write).
    writer: Option<File>,
}

impl FileAuditBackend {
    /// Backend on `path`. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut File, AuditError> {
        let file = match self.writer.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?,
        };
        Ok(self.writer.insert(file))
    }
}

/// An append target that can be cut back to a known length.
trait LineSink: Write {
    fn end(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

impl LineSink for File {
    fn end(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Write `line` completely or not at all. A partial write is cut off again.
fn append_line<S: LineSink>(sink: &mut S, line: &[u8]) -> io::Result<()> {
    let start = sink.end()?;
    let written = sink
        .write_all(line)
        .and_then(|()| sink.flush())
        .and_then(|()| sink.sync());
    if let Err(e) = written {
        if let Err(cut) = sink.truncate(start) {
            tracing::error!(error = %cut, offset = start, "failed to roll back partial audit line");
        }
        return Err(e);
    }
    Ok(())
}

impl AuditBackend for FileAuditBackend {
    fn append(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let writer = self.writer()?;
        if let Err(e) = append_line(writer, line.as_bytes()) {
            // reopen on the next append
            self.writer = None;
            return Err(e.into());
        }
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditEvent>, AuditError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut events = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: AuditEvent =
                serde_json::from_str(line).map_err(|e| AuditError::Integrity {
                    sequence: events.last().map_or(0, |p: &AuditEvent| p.sequence + 1),
                    message: format!("line {}: invalid event: {e}", idx + 1),
                })?;
            events.push(event);
        }
        Ok(events)
    }

    fn count(&self) -> Result<usize, AuditError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(reader
            .lines()
            .filter(|l| l.as_ref().is_ok_and(|s| !s.trim().is_empty()))
            .count())
    }

    fn remove_prefix_before(&mut self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let events = self.load_all()?;
        let n = expired_prefix(&events, cutoff);
        if n == 0 {
            return Ok(0);
        }

        // Rewrite to a sibling file and rename over the log.
        let tmp = self.path.with_extension("retention.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for event in &events[n..] {
                serde_json::to_writer(&mut out, event)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        self.writer = None;
        fs::rename(&tmp, &self.path)?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Actor, AuditConfig, AuditLogger, EventDraft};

    fn config() -> AuditConfig {
        AuditConfig {
            secret: "file-secret".into(),
            encryption_key: None,
        }
    }

    #[test]
    fn test_file_backend_persists_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let log = AuditLogger::open(&config(), Box::new(FileAuditBackend::new(&path))).unwrap();
            log.log_event(EventDraft::new(Actor::agent("a1"), "file.read", "x"))
                .unwrap();
            log.log_event(EventDraft::new(Actor::agent("a1"), "file.write", "y"))
                .unwrap();
        }

        let log = AuditLogger::open(&config(), Box::new(FileAuditBackend::new(&path))).unwrap();
        let e = log
            .log_event(EventDraft::new(Actor::agent("a1"), "file.read", "z"))
            .unwrap();
        assert_eq!(e.sequence, 3);
        assert_eq!(log.count().unwrap(), 3);
        log.verify().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 3);
    }

    #[test]
    fn test_tampered_line_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLogger::open(&config(), Box::new(FileAuditBackend::new(&path))).unwrap();
        log.log_event(EventDraft::new(Actor::agent("a1"), "file.read", "secret.txt"))
            .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, raw.replace("secret.txt", "public.txt")).unwrap();

        let reopened =
            AuditLogger::open(&config(), Box::new(FileAuditBackend::new(&path))).unwrap();
        assert!(matches!(
            reopened.verify(),
            Err(AuditError::Integrity { sequence: 1, .. })
        ));
    }

    #[test]
    fn test_file_retention_rewrites_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLogger::open(&config(), Box::new(FileAuditBackend::new(&path))).unwrap();
        log.log_event(EventDraft::new(Actor::agent("a1"), "file.read", "x"))
            .unwrap();

        let removed = log
            .expire_before(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(log.count().unwrap(), 1);
        log.verify().unwrap();
    }

    #[test]
    fn test_float_details_verify_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let log = AuditLogger::open(&config(), Box::new(FileAuditBackend::new(&path))).unwrap();
            for i in 0..200u32 {
                let cpu = f64::from(i) * 0.1 / 3.0;
                log.log_event(
                    EventDraft::new(Actor::agent("a1"), "sandbox.violation.soft", "a1-x")
                        .detail("cpu_percent", cpu)
                        .detail("peak_usage", serde_json::json!({ "cpu": cpu * 7.3, "ratio": 1.0 / 3.0 })),
                )
                .unwrap();
            }
        }

        let log = AuditLogger::open(&config(), Box::new(FileAuditBackend::new(&path))).unwrap();
        log.verify().unwrap();
        log.log_event(EventDraft::new(Actor::agent("a1"), "sandbox.end", "a1-x").detail("cpu_percent", 0.1 + 0.2))
            .unwrap();
        log.verify().unwrap();
        assert_eq!(log.count().unwrap(), 201);
    }

    /// In-memory sink that accepts `budget` bytes and then fails.
    struct ShortSink {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for ShortSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::other("no space left"));
            }
            let n = buf.len().min(self.budget);
            self.data.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LineSink for ShortSink {
        fn end(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_partial_line_is_rolled_back() {
        let mut sink = ShortSink {
            data: b"{\"sequence\":1}\n".to_vec(),
            budget: 5,
        };
        let before = sink.data.clone();
        assert!(append_line(&mut sink, b"{\"sequence\":2}\n").is_err());
        assert_eq!(sink.data, before);

        sink.budget = 64;
        append_line(&mut sink, b"{\"sequence\":2}\n").unwrap();
        assert_eq!(sink.data, b"{\"sequence\":1}\n{\"sequence\":2}\n".to_vec());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileAuditBackend::new(dir.path().join("none.jsonl"));
        assert_eq!(backend.count().unwrap(), 0);
        assert!(backend.load_all().unwrap().is_empty());
    }
}
