//! Audit logger for the append-only security log
//!
//! Entries are written as single JSON lines and flushed immediately. An
//! in-memory logger serves embedding and tests. If the file cannot be
//! written, [`AuditLogger::record`] keeps the entry in memory so it is not
//! lost and the calling operation is not failed by its own bookkeeping.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{FinguardError, FinguardResult};

use super::entry::{AuditEntry, Severity};

/// Handles writing audit entries to the audit log
///
/// The log file uses a line-delimited JSON format (JSONL) where each line
/// is a complete JSON object representing one audit entry.
pub struct AuditLogger {
    /// Path to the audit log file; `None` keeps everything in memory
    log_path: Option<PathBuf>,
    /// Entries held in memory (memory logger, or undeliverable file entries)
    held: Mutex<Vec<AuditEntry>>,
}

impl AuditLogger {
    /// Create a new AuditLogger that writes to the specified path
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            log_path: Some(log_path),
            held: Mutex::new(Vec::new()),
        }
    }

    /// Create a logger that keeps entries in memory only
    pub fn in_memory() -> Self {
        Self {
            log_path: None,
            held: Mutex::new(Vec::new()),
        }
    }

    fn held(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self, path: &Path) -> FinguardResult<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FinguardError::Io(format!("Failed to create audit directory: {}", e)))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FinguardError::Io(format!("Failed to open audit log: {}", e)))
    }

    /// Log an audit entry
    ///
    /// Appends the entry as a JSON line to the audit log file.
    pub fn log(&self, entry: &AuditEntry) -> FinguardResult<()> {
        self.log_batch(std::slice::from_ref(entry))
    }

    /// Log multiple audit entries, flushing once at the end
    pub fn log_batch(&self, entries: &[AuditEntry]) -> FinguardResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let path = match &self.log_path {
            Some(path) => path,
            None => {
                self.held().extend_from_slice(entries);
                return Ok(());
            }
        };

        let mut file = self.open(path)?;

        for entry in entries {
            let json = serde_json::to_string(entry)
                .map_err(|e| FinguardError::Json(format!("Failed to serialize audit entry: {}", e)))?;

            writeln!(file, "{}", json)
                .map_err(|e| FinguardError::Io(format!("Failed to write audit entry: {}", e)))?;
        }

        file.flush()
            .map_err(|e| FinguardError::Io(format!("Failed to flush audit log: {}", e)))?;

        Ok(())
    }

    /// Log an entry without failing the caller
    ///
    /// On a write failure the entry is held in memory and stays visible
    /// through [`read_all`](Self::read_all).
    pub fn record(&self, entry: AuditEntry) {
        if self.log(&entry).is_err() {
            self.held().push(entry);
        }
    }

    /// Read all audit entries, oldest first
    ///
    /// Held entries follow the file entries.
    pub fn read_all(&self) -> FinguardResult<Vec<AuditEntry>> {
        let mut entries = match &self.log_path {
            Some(path) if path.exists() => read_file(path)?,
            _ => Vec::new(),
        };
        entries.extend(self.held().iter().cloned());
        Ok(entries)
    }

    /// Read the most recent N entries from the log
    pub fn read_recent(&self, count: usize) -> FinguardResult<Vec<AuditEntry>> {
        let all_entries = self.read_all()?;
        let start = all_entries.len().saturating_sub(count);
        Ok(all_entries[start..].to_vec())
    }

    /// Entries at `Critical` severity (operator alerts)
    pub fn alerts(&self) -> FinguardResult<Vec<AuditEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.severity == Severity::Critical)
            .collect())
    }

    /// Get the number of entries in the audit log
    pub fn entry_count(&self) -> FinguardResult<usize> {
        Ok(self.read_all()?.len())
    }

    /// Number of entries that could not be written to the file
    pub fn held_count(&self) -> usize {
        if self.log_path.is_some() {
            self.held().len()
        } else {
            0
        }
    }

    /// Get the path to the audit log file
    pub fn path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }
}

fn read_file(path: &Path) -> FinguardResult<Vec<AuditEntry>> {
    let file = File::open(path)
        .map_err(|e| FinguardError::Io(format!("Failed to open audit log: {}", e)))?;

    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| {
            FinguardError::Io(format!("Failed to read audit log line {}: {}", line_num + 1, e))
        })?;

        if line.trim().is_empty() {
            continue;
        }

        let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
            FinguardError::Json(format!(
                "Failed to parse audit entry at line {}: {}",
                line_num + 1,
                e
            ))
        })?;

        entries.push(entry);
    }

    Ok(entries)
}
