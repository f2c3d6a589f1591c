//! The external collaborator traits (spec §6): everything the engine needs
//! from the host process (workspace/IO), cloud storage, persistence, and
//! notification, without depending on any concrete implementation of them.
//!
//! Every trait here ships an in-memory fake under [`crate::test_support`] so
//! the engine's own tests exercise full phase sequences without touching a
//! real filesystem, cloud account, or database.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connector::Connector;
use crate::event::EventEntry;
use crate::source::CloudBlockStorage;
use crate::task::SourceStats;
use crate::{MbsError, Result};

/// An opaque handle to an uploaded/stored artifact. The cloud SDK behind it
/// is out of scope (spec §1); this is just enough structure for the engine
/// to track "where did this go" and to re-derive container/path for deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRef {
    pub container: String,
    pub destination_path: String,
    pub size_bytes: Option<u64>,
}

#[async_trait]
pub trait Target: Send + Sync + std::fmt::Debug {
    async fn put_file(
        &self,
        local_path: &Path,
        destination_path: &str,
        overwrite_existing: bool,
    ) -> Result<TargetRef>;
    async fn delete_file(&self, reference: &TargetRef) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPriority {
    Info,
    Warning,
    Critical,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_event_notification(&self, subject: &str, message: &str, priority: NotificationPriority);
    async fn send_error_notification(&self, subject: &str, message: &str, error: &MbsError);
}

/// Options assembled for the `mongodump` invocation (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub journal: bool,
    pub force_table_scan: bool,
    pub oplog: bool,
    pub authentication_database: Option<String>,
    pub dump_db_users_and_roles: bool,
    pub database_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DumpOutcome {
    pub return_code: i32,
    pub last_log_line: String,
    pub dump_dir: PathBuf,
    pub data_size_bytes: u64,
}

/// Options assembled for the `mongorestore` invocation (spec §4.8).
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub oplog_replay: bool,
    pub authentication_database: Option<String>,
    pub restore_db_users_and_roles: bool,
    pub no_index_restore: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub return_code: i32,
    pub last_log_line: String,
}

/// Abstracts the host performing I/O on the engine's behalf: workspace
/// management, the dump/tar/restore subprocess calls, and upload/download.
#[async_trait]
pub trait BackupAssistant: Send + Sync {
    async fn create_task_workspace(&self, task_id: &str) -> Result<PathBuf>;
    async fn delete_task_workspace(&self, workspace: &Path) -> Result<()>;
    async fn is_connector_local_to_assistant(&self, connector: &dyn Connector) -> Result<bool>;

    async fn suspend_io(&self, connector: &dyn Connector, cbs: &dyn CloudBlockStorage) -> Result<()>;
    async fn resume_io(&self, connector: &dyn Connector, cbs: &dyn CloudBlockStorage) -> Result<()>;

    async fn dump_backup(
        &self,
        uri: &str,
        dest: &Path,
        log_file: &Path,
        options: &DumpOptions,
    ) -> Result<DumpOutcome>;

    async fn tar_backup(&self, dir: &Path, tar_name: &str) -> Result<PathBuf>;

    async fn upload_backup(
        &self,
        tar_path: &Path,
        targets: &[Arc<dyn Target>],
        destination_path: &str,
    ) -> Result<Vec<TargetRef>>;

    async fn upload_backup_log_file(
        &self,
        log_file: &Path,
        target: &dyn Target,
        destination_path: &str,
    ) -> Result<TargetRef>;

    async fn download_restore_source_backup(
        &self,
        target_reference: &TargetRef,
        dest: &Path,
    ) -> Result<PathBuf>;

    async fn extract_restore_source_backup(&self, archive_path: &Path) -> Result<PathBuf>;

    async fn run_mongo_restore(
        &self,
        destination_uri: &str,
        dump_dir: &Path,
        source_database_name: Option<&str>,
        log_file: &Path,
        delete_old_admin_users_file: bool,
        delete_old_users_file: bool,
        options: &RestoreOptions,
    ) -> Result<RestoreOutcome>;
}

/// Explicit per-phase update payload (spec §9 design note): replaces the
/// original's dynamic "list of property names to persist" with a struct that
/// names every field a phase can write. `event`, if present, is the entry
/// appended atomically alongside whichever other fields are set.
#[derive(Debug, Clone, Default)]
pub struct BackupUpdate {
    pub source_stats: Option<SourceStats>,
    pub selected_sources: Option<Vec<crate::task::SelectedSource>>,
    pub target_reference: Option<Option<TargetRef>>,
    pub secondary_target_references: Option<Vec<TargetRef>>,
    pub log_target_reference: Option<Option<TargetRef>>,
    pub backup_rate_in_mbps: Option<f64>,
    pub reschedulable: Option<bool>,
    pub strategy: Option<crate::strategy::StrategyConfig>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub event: Option<EventEntry>,
}

impl BackupUpdate {
    pub fn is_empty(&self) -> bool {
        self.source_stats.is_none()
            && self.selected_sources.is_none()
            && self.target_reference.is_none()
            && self.secondary_target_references.is_none()
            && self.log_target_reference.is_none()
            && self.backup_rate_in_mbps.is_none()
            && self.reschedulable.is_none()
            && self.strategy.is_none()
            && self.name.is_none()
            && self.description.is_none()
            && self.event.is_none()
    }

    pub fn with_event(event: EventEntry) -> Self {
        Self {
            event: Some(event),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreUpdate {
    pub destination_stats: Option<SourceStats>,
    pub reschedulable: Option<bool>,
    pub log_target_reference: Option<Option<TargetRef>>,
    pub event: Option<EventEntry>,
}

impl RestoreUpdate {
    pub fn is_empty(&self) -> bool {
        self.destination_stats.is_none()
            && self.reschedulable.is_none()
            && self.log_target_reference.is_none()
            && self.event.is_none()
    }

    pub fn with_event(event: EventEntry) -> Self {
        Self {
            event: Some(event),
            ..Default::default()
        }
    }
}

/// A minimal, serializable projection of a previously persisted backup, used
/// to route restores (spec §4.7: "route by the presence of END_EXTRACT in
/// the source backup's event log").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: String,
    pub name: String,
    pub events: crate::event::EventLog,
    pub source_stats: SourceStats,
    pub target_reference: Option<TargetRef>,
}

/// Transactional persistence over `{events, listed properties}` (spec §6).
///
/// Implementations MUST reject (or, per the original, fail loudly and
/// notify at CRITICAL priority) a call whose update carries neither
/// properties nor an event — see [`guard_nonempty_backup_update`] /
/// [`guard_nonempty_restore_update`], which every real implementation is
/// expected to call first.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn update_backup(&self, task_id: &str, update: BackupUpdate) -> Result<()>;
    async fn update_restore(&self, task_id: &str, update: RestoreUpdate) -> Result<()>;
    async fn get_backup(&self, id: &str) -> Result<Option<BackupSnapshot>>;
}

/// Enforces spec §4.2 point 3 / P9: a call with neither properties nor an
/// event is a programming error, not a runtime condition. Debug builds
/// assert; all builds notify at CRITICAL priority and return an error so the
/// caller cannot silently proceed as if the update had been persisted.
pub async fn guard_nonempty_backup_update(
    notifier: &dyn Notifier,
    update: &BackupUpdate,
) -> Result<()> {
    if update.is_empty() {
        let err = MbsError::Configuration(
            "updateBackup called with neither properties nor an event".to_string(),
        );
        notifier
            .send_error_notification("MBS programming error", &err.to_string(), &err)
            .await;
        debug_assert!(
            false,
            "updateBackup called with neither properties nor an event"
        );
        return Err(err);
    }
    Ok(())
}

pub async fn guard_nonempty_restore_update(
    notifier: &dyn Notifier,
    update: &RestoreUpdate,
) -> Result<()> {
    if update.is_empty() {
        let err = MbsError::Configuration(
            "updateRestore called with neither properties nor an event".to_string(),
        );
        notifier
            .send_error_notification("MBS programming error", &err.to_string(), &err)
            .await;
        debug_assert!(
            false,
            "updateRestore called with neither properties nor an event"
        );
        return Err(err);
    }
    Ok(())
}
