//! Bounded in-memory error log

use crate::context::{ErrorSink, log_report};
use crate::types::Severity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// One recorded report
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    /// Monotonic id, unique within one log
    pub id: u64,
    /// When the report was received
    pub timestamp: DateTime<Utc>,
    /// Report severity
    pub severity: Severity,
    /// Short summary
    pub title: String,
    /// Full description
    pub detail: String,
}

/// Error sink keeping the most recent reports for a status surface
///
/// Holds at most `capacity` entries; the oldest is evicted first. Every report is
/// also logged through `tracing`.
#[derive(Debug)]
pub struct ErrorLog {
    capacity: usize,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<ErrorEntry>>,
}

impl ErrorLog {
    /// Log retaining up to `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Retained entries, oldest first
    pub fn entries(&self) -> Vec<ErrorEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl ErrorSink for ErrorLog {
    fn report(&self, severity: Severity, title: &str, detail: &str) {
        log_report(severity, title, detail);
        if self.capacity == 0 {
            return;
        }

        let entry = ErrorEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            severity,
            title: title.to_string(),
            detail: detail.to_string(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn entries(&self) -> Vec<ErrorEntry> {
        ErrorLog::entries(self)
    }
}
