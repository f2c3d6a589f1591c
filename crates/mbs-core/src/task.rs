//! [`Backup`] and [`Restore`] tasks, and the [`TaskCore`] fields/behavior
//! they share.
//!
//! Both extend a common notion of "task" (id, try count, workspace, event
//! log) without Rust inheritance to lean on; [`TaskLike`] is the capability
//! trait that replaces it, with default methods delegating to `core()`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assistant::TargetRef;
use crate::event::{EventEntry, EventLog, EventType};
use crate::source::BackupSource;
use crate::strategy::StrategyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupMode {
    Online,
    Offline,
}

impl Default for BackupMode {
    fn default() -> Self {
        BackupMode::Online
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberPreference {
    Best,
    PrimaryOnly,
    SecondaryOnly,
    NotPrimary,
}

impl Default for MemberPreference {
    fn default() -> Self {
        MemberPreference::Best
    }
}

/// The concrete member an earlier selection phase picked, reconstructible
/// from persisted source stats on resume (spec §4.3 step 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedSource {
    pub address: String,
    pub is_primary: bool,
}

/// Fields every Task carries, factored out of [`Backup`]/[`Restore`].
#[derive(Debug, Clone)]
pub struct TaskCore {
    pub id: String,
    pub try_count: u32,
    pub workspace: Option<PathBuf>,
    pub reschedulable: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub events: EventLog,
}

impl TaskCore {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            try_count: 0,
            workspace: None,
            reschedulable: false,
            start_date: None,
            events: EventLog::new(),
        }
    }

    pub fn record(
        &mut self,
        name: &str,
        event_type: EventType,
        message: Option<String>,
        details: Option<String>,
        error_code: Option<String>,
    ) {
        let mut entry = EventEntry::new(name, event_type);
        if let Some(m) = message {
            entry = entry.with_message(m);
        }
        if let Some(d) = details {
            entry = entry.with_details(d);
        }
        if let Some(c) = error_code {
            entry = entry.with_error_code(c);
        }
        self.events.append(entry);
    }
}

/// Capability trait standing in for the "extends Task" relationship: every
/// concrete task type implements this by exposing its [`TaskCore`], and gets
/// the shared event-log convenience methods for free.
pub trait TaskLike {
    fn core(&self) -> &TaskCore;
    fn core_mut(&mut self) -> &mut TaskCore;

    fn is_event_logged(&self, name: &str) -> bool {
        self.core().events.contains(name)
    }

    fn last_event(&self, name: &str) -> Option<&EventEntry> {
        self.core().events.last(name)
    }

    /// START/END happens-before check used throughout the quiescence
    /// coordinator (is the server currently locked / IO currently suspended,
    /// purely from the event log).
    fn is_open(&self, start_name: &str, end_name: &str) -> bool {
        self.core().events.last_is_after(start_name, end_name)
    }

    fn log_info(&mut self, name: &str, message: Option<String>) {
        self.core_mut()
            .record(name, EventType::Info, message, None, None);
    }

    fn log_warning(&mut self, name: &str, message: impl Into<String>) {
        self.core_mut()
            .record(name, EventType::Warning, Some(message.into()), None, None);
    }

    fn log_error(&mut self, name: &str, message: impl Into<String>, error_code: Option<String>) {
        self.core_mut().record(
            name,
            EventType::Error,
            Some(message.into()),
            None,
            error_code,
        );
    }
}

/// A backup task: source + strategy + destination(s), plus whatever the
/// strategy has recorded about its progress so far.
pub struct Backup {
    pub core: TaskCore,
    pub source: Arc<dyn BackupSource>,
    pub target: Arc<dyn crate::assistant::Target>,
    pub secondary_targets: Vec<Arc<dyn crate::assistant::Target>>,
    pub strategy: StrategyConfig,
    pub plan: Option<String>,
    pub plan_occurrence: Option<String>,
    pub name: String,
    pub description: String,
    pub source_stats: SourceStats,
    pub selected_sources: Vec<SelectedSource>,
    pub target_reference: Option<TargetRef>,
    pub secondary_target_references: Vec<TargetRef>,
    pub log_target_reference: Option<TargetRef>,
    pub backup_rate_in_mbps: Option<f64>,
}

impl TaskLike for Backup {
    fn core(&self) -> &TaskCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }
}

/// Free-form stats captured about the source at selection time: data size,
/// database name, mongo version, and whether it reports a replica set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub data_size: Option<u64>,
    pub database_name: Option<String>,
    pub version: Option<String>,
    pub has_repl: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A restore task: a prior backup, a destination, and optional database
/// scoping.
pub struct Restore {
    pub core: TaskCore,
    pub source_backup_name: String,
    pub source_backup_events: EventLog,
    pub source_stats: SourceStats,
    pub destination_uri: String,
    pub source_database_name: Option<String>,
    /// The originating `BackupSource`'s configured database name, as it was
    /// at backup time (spec §4.8 precedence tier 2, distinct from whatever
    /// `sourceStats.databaseName` recorded).
    pub source_backup_database_name: Option<String>,
    /// A destination-level configured database, appended to the
    /// destination URI if it doesn't already carry one (spec §4.8).
    pub destination_database_name: Option<String>,
    pub destination_stats: SourceStats,
    /// Where the restore log file (spec §6, `RESTORE_`-prefixed) is
    /// uploaded to; distinct from any target the source backup used.
    pub log_target: Arc<dyn crate::assistant::Target>,
    pub log_target_reference: Option<TargetRef>,
}

impl TaskLike for Restore {
    fn core(&self) -> &TaskCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_core_events_round_trip() {
        let mut core = TaskCore::new("t1");
        core.record("START_EXTRACT", EventType::Info, None, None, None);
        assert!(core.events.contains("START_EXTRACT"));
        assert!(!core.events.contains("END_EXTRACT"));
    }
}
