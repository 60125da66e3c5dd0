//! Bounded in-memory log of executed pool operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_ACTIVITY_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ActivityStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub connection: String,
    pub status: ActivityStatus,
    pub duration_ms: u64,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Ring buffer of the most recent [`ActivityEntry`] values.
#[derive(Debug)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ACTIVITY_CAPACITY)
    }
}

impl ActivityLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, VecDeque<ActivityEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(
        &self,
        operation: &str,
        connection: &str,
        elapsed: Duration,
        attempts: u32,
        error: Option<String>,
    ) -> ActivityEntry {
        let entry = ActivityEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation: operation.to_string(),
            connection: connection.to_string(),
            status: if error.is_some() {
                ActivityStatus::Error
            } else {
                ActivityStatus::Success
            },
            duration_ms: elapsed.as_millis() as u64,
            attempts,
            error,
        };

        let mut entries = self.entries();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        entry
    }

    /// Newest first, at most `limit` entries.
    pub fn recent(&self, limit: usize) -> Vec<ActivityEntry> {
        self.entries().iter().rev().take(limit).cloned().collect()
    }

    /// Newest first, only entries for `connection`.
    pub fn for_connection(&self, connection: &str, limit: usize) -> Vec<ActivityEntry> {
        self.entries()
            .iter()
            .rev()
            .filter(|e| e.connection == connection)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn error_count(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.status == ActivityStatus::Error)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entries_are_evicted() {
        let log = ActivityLog::with_capacity(3);
        for i in 0..5 {
            log.record(&format!("op{}", i), "h:21:u", Duration::from_millis(1), 1, None);
        }
        assert_eq!(log.len(), 3);
        let ops: Vec<_> = log.recent(10).into_iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec!["op4", "op3", "op2"]);
    }

    #[test]
    fn status_follows_error() {
        let log = ActivityLog::default();
        let ok = log.record("list", "a:21:u", Duration::from_millis(12), 1, None);
        let failed = log.record("upload", "b:21:u", Duration::ZERO, 4, Some("timeout".into()));
        assert_eq!(ok.status, ActivityStatus::Success);
        assert_eq!(failed.status, ActivityStatus::Error);
        assert_eq!(log.error_count(), 1);
        assert_eq!(log.for_connection("b:21:u", 10), vec![failed]);
        log.clear();
        assert!(log.is_empty());
    }
}
