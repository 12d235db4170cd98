use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::lookup::LookupQuery;

#[derive(Debug, Clone, Serialize)]
pub struct LookupFailure {
    pub row: usize,
    pub identifier: String,
    pub year: Option<String>,
    pub status: Option<u16>,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl LookupFailure {
    pub fn new(row: usize, query: &LookupQuery, err: &AppError) -> Self {
        let (status, detail) = match err {
            AppError::LookupFailed { status, detail } => (*status, detail.clone()),
            other => (None, other.to_string()),
        };
        Self {
            row,
            identifier: query.identifier.clone(),
            year: query.year.clone(),
            status,
            detail,
            timestamp: Utc::now(),
        }
    }
}

/// Bounded record of lookups that failed for reasons other than cancellation.
///
/// Failures are kept in memory for inspection and, when a buffer path is
/// configured, appended to it as JSON lines.
#[derive(Clone)]
pub struct LookupDiagnostics {
    recent: Arc<Mutex<VecDeque<LookupFailure>>>,
    total: Arc<AtomicU64>,
    capacity: usize,
    buffer_path: Option<PathBuf>,
}

impl LookupDiagnostics {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        if let Some(path) = &config.diagnostics_path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            OpenOptions::new().create(true).append(true).open(path)?;
        }
        Ok(Self {
            recent: Arc::new(Mutex::new(VecDeque::new())),
            total: Arc::new(AtomicU64::new(0)),
            capacity: config.diagnostics_capacity.max(1),
            buffer_path: config.diagnostics_path.clone(),
        })
    }

    pub fn in_memory(capacity: usize) -> Self {
        Self {
            recent: Arc::new(Mutex::new(VecDeque::new())),
            total: Arc::new(AtomicU64::new(0)),
            capacity: capacity.max(1),
            buffer_path: None,
        }
    }

    /// Keeps the failure in memory even when appending to the buffer file fails.
    pub fn record(&self, failure: LookupFailure) -> AppResult<()> {
        let line = serde_json::to_vec(&failure)?;
        {
            let mut recent = self.recent.lock();
            recent.push_back(failure);
            while recent.len() > self.capacity {
                recent.pop_front();
            }
        }
        self.total.fetch_add(1, Ordering::Relaxed);

        if let Some(path) = &self.buffer_path {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(&line)?;
            file.write_all(b"\n")?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn recent(&self) -> Vec<LookupFailure> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn total_failures(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn buffer_path(&self) -> Option<&Path> {
        self.buffer_path.as_deref()
    }
}
