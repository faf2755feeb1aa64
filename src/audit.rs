use crate::errors::{AppError, AppResult};
use crate::models::AuditEvent;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Append-only destination for end-of-life record events.
///
/// `emit` runs while the store holds its connection lock for the removal
/// transaction. Implementations must not call back into the same store and
/// should return promptly; every other store call waits on them.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent) -> AppResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) -> AppResult<()> {
        let payload = serde_json::to_string(event)?;
        tracing::info!(
            target: "audit",
            event_id = %event.id,
            action = event.action.as_str(),
            record_id = %event.record.id,
            actor_id = %event.actor_id,
            payload = %payload,
            "record removed"
        );
        Ok(())
    }
}

/// Writes one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    file: Mutex<File>,
    path: PathBuf,
}

impl JsonLinesAuditSink {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn emit(&self, event: &AuditEvent) -> AppResult<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| AppError::Internal("audit file mutex poisoned".to_string()))?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}
