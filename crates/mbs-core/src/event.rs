//! The append-only event log that lives on every [`crate::task::TaskCore`].
//!
//! The log is the resumption substrate for the whole engine: every phase
//! checks whether its `END_*` event is already present before doing any
//! work, so a rescheduled task skips phases a previous attempt finished.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEntry {
    pub name: String,
    pub event_type: EventType,
    pub message: Option<String>,
    pub details: Option<String>,
    pub date: DateTime<Utc>,
    pub error_code: Option<String>,
}

impl EventEntry {
    pub fn new(name: impl Into<String>, event_type: EventType) -> Self {
        Self {
            name: name.into(),
            event_type,
            message: None,
            details: None,
            date: Utc::now(),
            error_code: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }
}

/// Append-only log with O(1)-ish "exists by name" / "last entry by name"
/// lookups. Entries are never removed or reordered (P1, event monotonicity).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLog {
    entries: Vec<EventEntry>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: EventEntry) {
        self.entries.push(entry);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn last(&self, name: &str) -> Option<&EventEntry> {
        self.entries.iter().rev().find(|e| e.name == name)
    }

    pub fn entries(&self) -> &[EventEntry] {
        &self.entries
    }

    /// True iff `end_name`'s last occurrence is logged after `start_name`'s.
    /// Used by the quiescence coordinator to tell whether IO is currently
    /// suspended / the server is currently locked, purely from log state.
    pub fn last_is_after(&self, start_name: &str, end_name: &str) -> bool {
        match (self.last(start_name), self.last(end_name)) {
            (Some(start), Some(end)) => start.date > end.date,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_and_last_lookup() {
        let mut log = EventLog::new();
        assert!(!log.contains("START_EXTRACT"));
        log.append(EventEntry::new("START_EXTRACT", EventType::Info));
        assert!(log.contains("START_EXTRACT"));
        assert!(!log.contains("END_EXTRACT"));
        log.append(EventEntry::new("END_EXTRACT", EventType::Info));
        assert_eq!(log.last("END_EXTRACT").unwrap().name, "END_EXTRACT");
    }

    #[test]
    fn last_is_after_tracks_suspend_resume_ordering() {
        let mut log = EventLog::new();
        assert!(!log.last_is_after("SUSPEND_IO", "RESUME_IO"));
        log.append(EventEntry::new("SUSPEND_IO", EventType::Info));
        assert!(log.last_is_after("SUSPEND_IO", "RESUME_IO"));
        log.append(EventEntry::new("RESUME_IO", EventType::Info));
        assert!(!log.last_is_after("SUSPEND_IO", "RESUME_IO"));
        log.append(EventEntry::new("SUSPEND_IO", EventType::Info));
        assert!(log.last_is_after("SUSPEND_IO", "RESUME_IO"));
    }
}
