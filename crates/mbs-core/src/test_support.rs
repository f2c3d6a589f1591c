//! In-memory fakes for every external collaborator trait (spec §1.1
//! "Test tooling"), mirroring the teacher's `Repo`/`Memory` pairing: each
//! fake behaves correctly enough to drive full phase sequences through this
//! crate's own test suite (and downstream integration tests, e.g.
//! `mbsctl`'s) without a filesystem, network, or cloud account.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::assistant::{
    BackupAssistant, BackupSnapshot, BackupUpdate, DumpOptions, DumpOutcome, Notifier, NotificationPriority,
    RestoreOptions, RestoreOutcome, RestoreUpdate, Target, TargetRef, TaskStore,
};
use crate::connector::{
    Connector, ConnectorFactory, ConnectorKind, MongoServerConnector, MongoVersion, ReplicaSetConnector,
    ReplicaSetMember, ShardedClusterConnector,
};
use crate::source::{CloudBlockStorage, SnapshotRef, SnapshotStatus};
use crate::task::{Backup, SourceStats, TaskCore};
use crate::{MbsError, Result};

/// A minimal [`Backup`] with a primary-only source, useful as a baseline in
/// tests that don't care about the source/target wiring.
pub fn backup_fixture() -> Backup {
    use crate::source::{CloudBlockStorageConfig, MongoSource};
    use crate::strategy::{CommonSettings, DumpStrategyConfig, StrategyConfig};

    Backup {
        core: TaskCore::new("task-1"),
        source: Arc::new(MongoSource {
            uri: "mongodb://p:27017".to_string(),
            database_name: None,
            cloud_block_storage: CloudBlockStorageConfig::None,
        }),
        target: Arc::new(FakeTarget::default()),
        secondary_targets: Vec::new(),
        strategy: StrategyConfig::DumpStrategy(DumpStrategyConfig {
            common: CommonSettings::default(),
            dump_users: None,
        }),
        plan: None,
        plan_occurrence: None,
        name: "backup-1".to_string(),
        description: "test backup".to_string(),
        source_stats: SourceStats::default(),
        selected_sources: Vec::new(),
        target_reference: None,
        secondary_target_references: Vec::new(),
        log_target_reference: None,
        backup_rate_in_mbps: None,
    }
}

#[derive(Debug, Clone)]
pub struct FakeConnector {
    pub address: String,
    pub kind: ConnectorKind,
    pub online: bool,
    pub primary: bool,
    pub secondary: bool,
    pub replica_member: bool,
    pub config_server: bool,
    pub admin_credentials: bool,
    pub version: MongoVersion,
    pub locked: Arc<std::sync::atomic::AtomicBool>,
    pub fail_unlock: bool,
    pub members: Vec<ReplicaSetMember>,
    pub data_size: u64,
}

impl FakeConnector {
    pub fn primary(address: &str) -> Self {
        Self {
            address: address.to_string(),
            kind: ConnectorKind::Server,
            online: true,
            primary: true,
            secondary: false,
            replica_member: false,
            config_server: false,
            admin_credentials: true,
            version: MongoVersion::new(3, 0, 0),
            locked: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            fail_unlock: false,
            members: Vec::new(),
            data_size: 1024,
        }
    }

    pub fn with_data_size(mut self, data_size: u64) -> Self {
        self.data_size = data_size;
        self
    }

    pub fn secondary(address: &str) -> Self {
        Self {
            secondary: true,
            primary: false,
            replica_member: true,
            ..Self::primary(address)
        }
    }

    pub fn with_unlock_failure(mut self) -> Self {
        self.fail_unlock = true;
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn kind(&self) -> ConnectorKind {
        self.kind
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn is_replica_member(&self) -> bool {
        self.replica_member
    }

    fn is_config_server(&self) -> bool {
        self.config_server
    }

    fn has_admin_credentials(&self) -> bool {
        self.admin_credentials
    }

    async fn is_online(&self) -> bool {
        self.online
    }

    async fn is_primary(&self) -> Result<bool> {
        Ok(self.primary)
    }

    async fn is_secondary(&self) -> Result<bool> {
        Ok(self.secondary)
    }

    async fn mongo_version(&self) -> Result<MongoVersion> {
        Ok(self.version.clone())
    }

    async fn stats(&self, _only_for_db: Option<&str>) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "dataSize": self.data_size }))
    }

    fn as_mongo_server(&self) -> Option<&dyn MongoServerConnector> {
        Some(self)
    }
}

#[async_trait]
impl MongoServerConnector for FakeConnector {
    async fn fsynclock(&self) -> Result<()> {
        self.locked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn fsyncunlock(&self) -> Result<()> {
        if self.fail_unlock {
            return Err(MbsError::Connection {
                uri: self.address.clone(),
            });
        }
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_server_locked(&self) -> Result<bool> {
        Ok(self.locked.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Default)]
pub struct FakeConnectorFactory {
    pub members_by_uri: Mutex<HashMap<String, Vec<ReplicaSetMember>>>,
}

#[async_trait]
impl ConnectorFactory for FakeConnectorFactory {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connector>> {
        Ok(Arc::new(FakeConnector::primary(uri)))
    }

    async fn connect_to_member(&self, address: &str) -> Result<Arc<dyn Connector>> {
        Ok(Arc::new(FakeConnector::primary(address)))
    }
}

/// A [`ConnectorFactory`] whose connector reports a fixed `dataSize`, for
/// exercising the hybrid strategy's size predicate (spec §4.7).
#[derive(Debug)]
pub struct FakeConnectorFactoryWithStats {
    pub data_size: u64,
}

#[async_trait]
impl ConnectorFactory for FakeConnectorFactoryWithStats {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn Connector>> {
        Ok(Arc::new(FakeConnector::primary(uri).with_data_size(self.data_size)))
    }

    async fn connect_to_member(&self, address: &str) -> Result<Arc<dyn Connector>> {
        Ok(Arc::new(FakeConnector::primary(address).with_data_size(self.data_size)))
    }
}

#[derive(Debug, Clone)]
pub struct FakeCloudBlockStorage {
    pub name: String,
    pub status: Arc<Mutex<SnapshotStatus>>,
}

impl FakeCloudBlockStorage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: Arc::new(Mutex::new(SnapshotStatus::Pending)),
        }
    }
}

#[async_trait]
impl CloudBlockStorage for FakeCloudBlockStorage {
    async fn create_snapshot(&self, _name: &str, _description: &str) -> Result<SnapshotRef> {
        Ok(SnapshotRef::pending(false))
    }

    async fn delete_snapshot(&self, _snapshot_ref: &SnapshotRef) -> Result<()> {
        Ok(())
    }

    async fn check_snapshot_updates(&self, snapshot_ref: &SnapshotRef) -> Result<Option<SnapshotRef>> {
        let status = *self.status.lock().unwrap();
        if status == snapshot_ref.status {
            return Ok(None);
        }
        let mut updated = snapshot_ref.clone();
        updated.status = status;
        Ok(Some(updated))
    }

    async fn suspend_io(&self) -> Result<()> {
        Ok(())
    }

    async fn resume_io(&self) -> Result<()> {
        Ok(())
    }

    fn mount_point(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Default)]
pub struct FakeTarget {
    pub uploaded: Mutex<Vec<(String, PathBuf)>>,
    pub deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl Target for FakeTarget {
    async fn put_file(&self, local_path: &Path, destination_path: &str, _overwrite_existing: bool) -> Result<TargetRef> {
        self.uploaded
            .lock()
            .unwrap()
            .push((destination_path.to_string(), local_path.to_path_buf()));
        let size_bytes = std::fs::metadata(local_path).map(|m| m.len()).ok();
        Ok(TargetRef {
            container: "fake-container".to_string(),
            destination_path: destination_path.to_string(),
            size_bytes,
        })
    }

    async fn delete_file(&self, reference: &TargetRef) -> Result<()> {
        self.deleted.lock().unwrap().push(reference.destination_path.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeNotifier {
    pub events: Mutex<Vec<(String, String)>>,
    pub errors: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send_event_notification(&self, subject: &str, message: &str, _priority: NotificationPriority) {
        self.events
            .lock()
            .unwrap()
            .push((subject.to_string(), message.to_string()));
    }

    async fn send_error_notification(&self, subject: &str, _message: &str, _error: &MbsError) {
        self.errors.lock().unwrap().push(subject.to_string());
    }
}

/// Records every `BackupAssistant` call it receives, succeeding trivially;
/// individual tests construct a fresh one and flip specific behavior via the
/// `fail_*` flags when they need a failure path.
#[derive(Default)]
pub struct FakeBackupAssistant {
    pub fail_dump: Mutex<Option<DumpOutcome>>,
    pub dump_calls: AtomicU64,
    pub suspend_calls: AtomicU64,
    pub resume_calls: AtomicU64,
}

#[async_trait]
impl BackupAssistant for FakeBackupAssistant {
    async fn create_task_workspace(&self, task_id: &str) -> Result<PathBuf> {
        Ok(std::env::temp_dir().join(format!("mbs-test-{task_id}")))
    }

    async fn delete_task_workspace(&self, _workspace: &Path) -> Result<()> {
        Ok(())
    }

    async fn is_connector_local_to_assistant(&self, _connector: &dyn Connector) -> Result<bool> {
        Ok(true)
    }

    async fn suspend_io(&self, _connector: &dyn Connector, _cbs: &dyn CloudBlockStorage) -> Result<()> {
        self.suspend_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume_io(&self, _connector: &dyn Connector, _cbs: &dyn CloudBlockStorage) -> Result<()> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dump_backup(&self, _uri: &str, dest: &Path, _log_file: &Path, _options: &DumpOptions) -> Result<DumpOutcome> {
        self.dump_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.fail_dump.lock().unwrap().clone() {
            return Ok(outcome);
        }
        Ok(DumpOutcome {
            return_code: 0,
            last_log_line: "done dumping".to_string(),
            dump_dir: dest.to_path_buf(),
            data_size_bytes: 100 * 1024 * 1024,
        })
    }

    async fn tar_backup(&self, dir: &Path, tar_name: &str) -> Result<PathBuf> {
        Ok(dir.join(tar_name))
    }

    async fn upload_backup(&self, _tar_path: &Path, targets: &[Arc<dyn Target>], destination_path: &str) -> Result<Vec<TargetRef>> {
        let mut refs = Vec::with_capacity(targets.len());
        for _ in targets {
            refs.push(TargetRef {
                container: "fake-container".to_string(),
                destination_path: destination_path.to_string(),
                size_bytes: Some(100 * 1024 * 1024),
            });
        }
        Ok(refs)
    }

    async fn upload_backup_log_file(&self, _log_file: &Path, _target: &dyn Target, destination_path: &str) -> Result<TargetRef> {
        Ok(TargetRef {
            container: "fake-container".to_string(),
            destination_path: destination_path.to_string(),
            size_bytes: Some(1024),
        })
    }

    async fn download_restore_source_backup(&self, _target_reference: &TargetRef, dest: &Path) -> Result<PathBuf> {
        Ok(dest.to_path_buf())
    }

    async fn extract_restore_source_backup(&self, archive_path: &Path) -> Result<PathBuf> {
        Ok(archive_path.with_extension(""))
    }

    async fn run_mongo_restore(
        &self,
        _destination_uri: &str,
        _dump_dir: &Path,
        _source_database_name: Option<&str>,
        _log_file: &Path,
        _delete_old_admin_users_file: bool,
        _delete_old_users_file: bool,
        _options: &RestoreOptions,
    ) -> Result<RestoreOutcome> {
        Ok(RestoreOutcome {
            return_code: 0,
            last_log_line: "done restoring".to_string(),
        })
    }
}

#[derive(Default)]
pub struct FakeTaskStore {
    pub backup_updates: Mutex<Vec<BackupUpdate>>,
    pub restore_updates: Mutex<Vec<RestoreUpdate>>,
    pub backups: Mutex<HashMap<String, BackupSnapshot>>,
}

impl FakeTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_backup(&self, snapshot: BackupSnapshot) {
        self.backups.lock().unwrap().insert(snapshot.id.clone(), snapshot);
    }
}

#[async_trait]
impl TaskStore for FakeTaskStore {
    async fn update_backup(&self, _task_id: &str, update: BackupUpdate) -> Result<()> {
        self.backup_updates.lock().unwrap().push(update);
        Ok(())
    }

    async fn update_restore(&self, _task_id: &str, update: RestoreUpdate) -> Result<()> {
        self.restore_updates.lock().unwrap().push(update);
        Ok(())
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupSnapshot>> {
        Ok(self.backups.lock().unwrap().get(id).cloned())
    }
}

/// A connector that knows its replica set's full member list (the
/// original's `MongoCluster`), for exercising the selection algorithm
/// end-to-end rather than only its pure functions (see [`crate::selector`]).
#[derive(Debug, Clone)]
pub struct FakeReplicaSetConnector {
    pub address: String,
    pub members: Vec<ReplicaSetMember>,
    pub online: bool,
}

impl FakeReplicaSetConnector {
    pub fn new(address: &str, members: Vec<ReplicaSetMember>) -> Self {
        Self {
            address: address.to_string(),
            members,
            online: true,
        }
    }
}

#[async_trait]
impl Connector for FakeReplicaSetConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Cluster
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn has_admin_credentials(&self) -> bool {
        true
    }

    async fn is_online(&self) -> bool {
        self.online
    }

    async fn is_primary(&self) -> Result<bool> {
        Ok(false)
    }

    async fn is_secondary(&self) -> Result<bool> {
        Ok(false)
    }

    async fn mongo_version(&self) -> Result<MongoVersion> {
        Ok(MongoVersion::new(3, 0, 0))
    }

    async fn stats(&self, _only_for_db: Option<&str>) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "dataSize": 1024 }))
    }

    fn as_replica_set(&self) -> Option<&dyn ReplicaSetConnector> {
        Some(self)
    }
}

#[async_trait]
impl ReplicaSetConnector for FakeReplicaSetConnector {
    async fn members(&self) -> Result<Vec<ReplicaSetMember>> {
        Ok(self.members.clone())
    }
}

/// A mongos entry point with balancer control (the original's
/// `ShardedClusterConnector`).
#[derive(Debug)]
pub struct FakeShardedConnector {
    pub address: String,
    pub shard_secondaries: Vec<ReplicaSetMember>,
    pub balancer_active: std::sync::atomic::AtomicBool,
    pub activity_during_monitor: std::sync::atomic::AtomicBool,
    pub monitoring: std::sync::atomic::AtomicBool,
    pub resume_succeeds: std::sync::atomic::AtomicBool,
}

impl FakeShardedConnector {
    pub fn new(address: &str, shard_secondaries: Vec<ReplicaSetMember>) -> Self {
        Self {
            address: address.to_string(),
            shard_secondaries,
            balancer_active: std::sync::atomic::AtomicBool::new(false),
            activity_during_monitor: std::sync::atomic::AtomicBool::new(false),
            monitoring: std::sync::atomic::AtomicBool::new(false),
            resume_succeeds: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Test hook: simulate the balancer becoming active while a monitor is
    /// running (spec P4).
    pub fn simulate_activity(&self) {
        self.balancer_active.store(true, Ordering::SeqCst);
        if self.monitoring.load(Ordering::SeqCst) {
            self.activity_during_monitor.store(true, Ordering::SeqCst);
        }
    }

    /// Test hook: make `resume_balancer` a no-op, so callers that poll for
    /// `is_balancer_active()` afterward observe it never coming back.
    pub fn set_resume_succeeds(&self, succeeds: bool) {
        self.resume_succeeds.store(succeeds, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeShardedConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Sharded
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn has_admin_credentials(&self) -> bool {
        true
    }

    async fn is_online(&self) -> bool {
        true
    }

    async fn is_primary(&self) -> Result<bool> {
        Ok(false)
    }

    async fn is_secondary(&self) -> Result<bool> {
        Ok(false)
    }

    async fn mongo_version(&self) -> Result<MongoVersion> {
        Ok(MongoVersion::new(3, 0, 0))
    }

    async fn stats(&self, _only_for_db: Option<&str>) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "dataSize": 1024 }))
    }

    fn as_sharded(&self) -> Option<&dyn ShardedClusterConnector> {
        Some(self)
    }
}

#[async_trait]
impl ShardedClusterConnector for FakeShardedConnector {
    async fn select_shard_best_secondaries(&self, _max_lag_seconds: u64) -> Result<Vec<ReplicaSetMember>> {
        Ok(self.shard_secondaries.clone())
    }

    async fn is_balancer_active(&self) -> Result<bool> {
        Ok(self.balancer_active.load(Ordering::SeqCst))
    }

    async fn stop_balancer(&self) -> Result<()> {
        self.balancer_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn resume_balancer(&self) -> Result<()> {
        if self.resume_succeeds.load(Ordering::SeqCst) {
            self.balancer_active.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn start_balancer_activity_monitor(&self) {
        self.monitoring.store(true, Ordering::SeqCst);
        self.activity_during_monitor.store(false, Ordering::SeqCst);
    }

    fn stop_balancer_activity_monitor(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
    }

    fn balancer_active_during_monitor(&self) -> bool {
        self.activity_during_monitor.load(Ordering::SeqCst)
    }
}

