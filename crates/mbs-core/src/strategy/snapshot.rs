//! Snapshot strategy (C7, spec §4.6): kick off a cloud block-storage
//! snapshot under the quiescence protocol, then poll until it reaches a
//! terminal status.

use std::sync::Arc;
use std::time::Duration;

use mbs_errors::VolumeError;
use serde::{Deserialize, Serialize};

use crate::connector::Connector;
use crate::context::MbsContext;
use crate::event::EventType;
use crate::quiescence;
use crate::retry::{robustify, RetryPolicy};
use crate::source::{CloudBlockStorage, ShareableSnapshot, SnapshotRef, SnapshotStatus};
use crate::task::{Backup, BackupMode, TaskLike};
use crate::{assistant::BackupUpdate, MbsError, Result};

use super::CommonSettings;

pub const START_BLOCK_STORAGE_SNAPSHOT: &str = "START_BLOCK_STORAGE_SNAPSHOT";
pub const END_BLOCK_STORAGE_SNAPSHOT: &str = "END_BLOCK_STORAGE_SNAPSHOT";
pub const START_KICKOFF_SNAPSHOT: &str = "START_KICKOFF_SNAPSHOT";
pub const END_KICKOFF_SNAPSHOT: &str = "END_KICKOFF_SNAPSHOT";
pub const START_CREATE_SNAPSHOT: &str = "START_CREATE_SNAPSHOT";
pub const END_CREATE_SNAPSHOT: &str = "END_CREATE_SNAPSHOT";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStrategyConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    #[serde(default)]
    pub share_users: Vec<String>,
    #[serde(default)]
    pub share_groups: Vec<String>,
}

/// spec §4.7: a snapshot backup only needs a fresh member once kickoff has
/// actually completed; while polling for a terminal status it has nothing
/// left to pick.
pub fn needs_new_member_selection(backup: &Backup) -> bool {
    !backup.is_event_logged(END_KICKOFF_SNAPSHOT)
}

pub fn needs_new_source_stats(backup: &Backup) -> bool {
    !backup.is_event_logged(END_KICKOFF_SNAPSHOT)
}

/// spec §4.6 "Cloud-block restore is unsupported": calling it is a terminal
/// configuration error, never retried.
pub fn restore_unsupported() -> Result<()> {
    Err(MbsError::Configuration(
        "cloud block storage restore is not supported".to_string(),
    ))
}

fn cbs_for(backup: &Backup, address: &str) -> Result<Arc<dyn CloudBlockStorage>> {
    backup.source.block_storage_by_address(address).ok_or_else(|| {
        MbsError::Configuration(format!("no cloud block storage configured for '{address}'"))
    })
}

struct QuiescenceHandles {
    use_fsynclock: bool,
    use_suspend_io: bool,
    sharded: bool,
    needs_balancer_resume: bool,
}

async fn acquire_quiescence(
    ctx: &MbsContext,
    backup: &mut Backup,
    connector: Arc<dyn Connector>,
    cbs: Arc<dyn CloudBlockStorage>,
    cfg: &SnapshotStrategyConfig,
) -> Result<QuiescenceHandles> {
    let is_use_fsynclock = cfg.common.use_fsynclock_effective();
    let is_use_suspend_io = cfg.common.use_suspend_io_effective();
    let offline = cfg.common.backup_mode == BackupMode::Offline || !connector.is_online().await;

    if offline {
        quiescence::persist_event(
            ctx,
            backup,
            crate::event::EventEntry::new(quiescence::NOT_LOCKED, EventType::Warning)
                .with_message("backup is offline; skipping fsynclock/suspendIO"),
        )
        .await?;
        return Ok(QuiescenceHandles {
            use_fsynclock: false,
            use_suspend_io: false,
            sharded: false,
            needs_balancer_resume: false,
        });
    }

    let sharded = connector.as_sharded().is_some();
    let mut needs_balancer_resume = false;
    if let Some(sharded_connector) = connector.as_sharded() {
        needs_balancer_resume = quiescence::stop_balancer_if_active(ctx, sharded_connector).await?;
        sharded_connector.start_balancer_activity_monitor();
    }

    quiescence::ensure_unlocked_and_resumed(ctx, backup, connector.as_ref(), Some(cbs.as_ref())).await;

    if is_use_fsynclock {
        quiescence::acquire_fsynclock(ctx, backup, connector.clone()).await?;
    }
    if is_use_suspend_io {
        quiescence::suspend_io(ctx, backup, connector.clone(), cbs.clone(), cfg.common.ensure_localhost).await?;
    }

    Ok(QuiescenceHandles {
        use_fsynclock: is_use_fsynclock,
        use_suspend_io: is_use_suspend_io,
        sharded,
        needs_balancer_resume,
    })
}

/// Releases resume-IO, fsyncunlock, then balancer, in that order (spec
/// §4.4's cleanup ordering). Called both on the happy path (after the
/// pending-status wait) and from the error path, so it must tolerate being
/// invoked when some or all of these were never acquired.
async fn release_quiescence(
    ctx: &MbsContext,
    backup: &mut Backup,
    connector: &dyn Connector,
    cbs: &dyn CloudBlockStorage,
    handles: &QuiescenceHandles,
) -> Result<()> {
    if handles.use_suspend_io {
        quiescence::resume_io_best_effort(ctx, backup, connector, cbs).await;
    }
    if handles.use_fsynclock {
        quiescence::fsyncunlock_best_effort(ctx, backup, connector).await;
    }
    if handles.sharded {
        if let Some(sharded_connector) = connector.as_sharded() {
            sharded_connector.stop_balancer_activity_monitor();
            if sharded_connector.balancer_active_during_monitor() {
                return Err(MbsError::BalancerActive);
            }
            if handles.needs_balancer_resume {
                quiescence::resume_balancer_and_wait(ctx, sharded_connector).await?;
            }
        }
    }
    Ok(())
}

async fn wait_for_status(
    cbs: &dyn CloudBlockStorage,
    mut current: SnapshotRef,
    wait_statuses: &[SnapshotStatus],
    poll_interval: Duration,
) -> Result<SnapshotRef> {
    loop {
        if wait_statuses.contains(&current.status) {
            return Ok(current);
        }
        tokio::time::sleep(poll_interval).await;
        if let Some(updated) = cbs.check_snapshot_updates(&current).await? {
            let changed = current.diff_fields(&updated);
            if !changed.is_empty() {
                tracing::info!(fields = ?changed, status = ?updated.status, "snapshot status update");
            }
            current = updated;
        }
    }
}

async fn share_if_configured(cfg: &SnapshotStrategyConfig, cbs: &dyn CloudBlockStorage, snapshot_ref: &SnapshotRef) -> Result<()> {
    if cfg.share_users.is_empty() && cfg.share_groups.is_empty() {
        return Ok(());
    }

    if let Some(constituents) = cbs.constituents() {
        for (constituent_cbs, constituent_ref) in constituents.iter().zip(&snapshot_ref.constituents) {
            share_if_configured(cfg, constituent_cbs.as_ref(), constituent_ref).await?;
        }
        return Ok(());
    }

    let Some(shareable) = cbs.as_shareable() else {
        return Ok(());
    };
    robustify(RetryPolicy::SHARE_SNAPSHOT, |_attempt| {
        shareable.share_snapshot(snapshot_ref, &cfg.share_users, &cfg.share_groups)
    })
    .await
}

/// Runs create-snapshot under the quiescence protocol and waits for the
/// provider to leave PENDING before releasing the lock/suspend (spec §4.6
/// "waitForPendingStatus"). Returns the (possibly still-pending) ref for the
/// caller to keep polling toward a terminal status after cleanup.
async fn run_kickoff(
    ctx: &MbsContext,
    backup: &mut Backup,
    cfg: &SnapshotStrategyConfig,
    connector: Arc<dyn Connector>,
    cbs: Arc<dyn CloudBlockStorage>,
) -> Result<SnapshotRef> {
    if backup.is_event_logged(END_KICKOFF_SNAPSHOT) {
        return Ok(SnapshotRef::pending(backup.is_event_logged(quiescence::FSYNCLOCK_END)));
    }

    quiescence::persist_event(
        ctx,
        backup,
        crate::event::EventEntry::new(START_KICKOFF_SNAPSHOT, EventType::Info),
    )
    .await?;

    let handles = acquire_quiescence(ctx, backup, connector.clone(), cbs.clone(), cfg).await?;

    let run_result: Result<SnapshotRef> = async {
        quiescence::persist_event(
            ctx,
            backup,
            crate::event::EventEntry::new(START_CREATE_SNAPSHOT, EventType::Info),
        )
        .await?;

        // spec §3: "name, description (rendered from schemes; may be updated
        // before snapshot capture)" — re-render just ahead of the call that
        // actually stamps the snapshot with them.
        if let Some(scheme) = ctx.naming_scheme.as_ref() {
            backup.name = scheme.render_name(backup);
            backup.description = scheme.render_description(backup);
        }

        let source_was_locked = backup.is_event_logged(quiescence::FSYNCLOCK_END);
        let mut snapshot_ref = cbs.create_snapshot(&backup.name, &backup.description).await?;
        snapshot_ref.source_was_locked = source_was_locked;

        quiescence::persist_event(
            ctx,
            backup,
            crate::event::EventEntry::new(END_CREATE_SNAPSHOT, EventType::Info),
        )
        .await?;

        wait_for_status(
            cbs.as_ref(),
            snapshot_ref,
            &[SnapshotStatus::Pending, SnapshotStatus::Completed, SnapshotStatus::Error],
            Duration::from_secs(ctx.config.snapshot_pending_poll_seconds),
        )
        .await
    }
    .await;

    let snapshot_ref = match run_result {
        Ok(r) => r,
        Err(e) => {
            release_quiescence(ctx, backup, connector.as_ref(), cbs.as_ref(), &handles).await.ok();
            return Err(e);
        }
    };

    release_quiescence(ctx, backup, connector.as_ref(), cbs.as_ref(), &handles).await?;
    share_if_configured(cfg, cbs.as_ref(), &snapshot_ref).await?;

    let target_reference = crate::assistant::TargetRef {
        container: "snapshot".to_string(),
        destination_path: backup.name.clone(),
        size_bytes: snapshot_ref.volume_size,
    };
    backup.target_reference = Some(target_reference.clone());
    let mut update = BackupUpdate::with_event(crate::event::EventEntry::new(END_KICKOFF_SNAPSHOT, EventType::Info));
    update.target_reference = Some(Some(target_reference));
    ctx.task_store.update_backup(&backup.core.id, update).await?;
    backup
        .core_mut()
        .events
        .append(crate::event::EventEntry::new(END_KICKOFF_SNAPSHOT, EventType::Info));

    Ok(snapshot_ref)
}

async fn wait_for_terminal(ctx: &MbsContext, cbs: &dyn CloudBlockStorage, current: SnapshotRef) -> Result<()> {
    let terminal = wait_for_status(
        cbs,
        current,
        &[SnapshotStatus::Completed, SnapshotStatus::Error],
        Duration::from_secs(ctx.config.snapshot_terminal_poll_seconds),
    )
    .await?;

    if terminal.status == SnapshotStatus::Error {
        return Err(MbsError::Volume(VolumeError::Snapshot(
            "snapshot reached a terminal ERROR status".to_string(),
        )));
    }
    Ok(())
}

/// Top-level snapshot-strategy run (spec §4.6 phase sequence).
pub async fn run(ctx: &MbsContext, backup: &mut Backup, cfg: &SnapshotStrategyConfig) -> Result<()> {
    if backup.is_event_logged(END_BLOCK_STORAGE_SNAPSHOT) {
        return Ok(());
    }
    quiescence::persist_event(
        ctx,
        backup,
        crate::event::EventEntry::new(START_BLOCK_STORAGE_SNAPSHOT, EventType::Info),
    )
    .await?;

    let connector = super::select_source_connector(ctx, backup, &cfg.common, needs_new_member_selection(backup)).await?;
    let cbs = cbs_for(backup, connector.address())?;

    let snapshot_ref = run_kickoff(ctx, backup, cfg, connector, cbs.clone()).await?;
    wait_for_terminal(ctx, cbs.as_ref(), snapshot_ref).await?;

    quiescence::persist_event(
        ctx,
        backup,
        crate::event::EventEntry::new(END_BLOCK_STORAGE_SNAPSHOT, EventType::Info),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CloudBlockStorageConfig;
    use crate::test_support::*;

    fn ctx() -> (MbsContext, Arc<FakeTaskStore>) {
        let store = Arc::new(FakeTaskStore::new());
        let ctx = MbsContext::new(
            crate::config::EngineConfig::default(),
            Arc::new(FakeNotifier::default()),
            Arc::new(FakeBackupAssistant::default()),
            store.clone(),
            Arc::new(FakeConnectorFactory::default()),
        );
        (ctx, store)
    }

    fn snapshot_backup() -> (Backup, Arc<FakeCloudBlockStorage>) {
        use crate::source::MongoSource;
        use crate::strategy::StrategyConfig;

        let cbs = Arc::new(FakeCloudBlockStorage::new("vol-a"));
        let mut backup = backup_fixture();
        backup.source = Arc::new(MongoSource {
            uri: "mongodb://p:27017".to_string(),
            database_name: None,
            cloud_block_storage: CloudBlockStorageConfig::Single(cbs.clone()),
        });
        backup.strategy = StrategyConfig::CloudBlockStorageStrategy(SnapshotStrategyConfig::default());
        (backup, cbs)
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_completes_once_status_turns_completed() {
        let (ctx, _store) = ctx();
        let (mut backup, fake_cbs) = snapshot_backup();
        let cfg = SnapshotStrategyConfig::default();

        // The fake's create_snapshot always starts PENDING, so the
        // kickoff-phase pending-wait returns immediately; the terminal poll
        // loop is the one that actually sleeps, and paused time auto-advances
        // through it since this status was set before the awaited call.
        *fake_cbs.status.lock().unwrap() = SnapshotStatus::Completed;
        run(&ctx, &mut backup, &cfg).await.unwrap();

        assert!(backup.is_event_logged(START_BLOCK_STORAGE_SNAPSHOT));
        assert!(backup.is_event_logged(START_KICKOFF_SNAPSHOT));
        assert!(backup.is_event_logged(END_CREATE_SNAPSHOT));
        assert!(backup.is_event_logged(END_KICKOFF_SNAPSHOT));
        assert!(backup.is_event_logged(END_BLOCK_STORAGE_SNAPSHOT));
        assert!(!backup.is_open(quiescence::FSYNCLOCK, quiescence::FSYNCUNLOCK));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_status_surfaces_as_volume_error() {
        let (ctx, _store) = ctx();
        let (mut backup, fake_cbs) = snapshot_backup();
        let cfg = SnapshotStrategyConfig::default();

        *fake_cbs.status.lock().unwrap() = SnapshotStatus::Error;
        let result = run(&ctx, &mut backup, &cfg).await;
        assert!(matches!(result, Err(MbsError::Volume(VolumeError::Snapshot(_)))));
    }

    struct FakeShardedConnectorFactory {
        sharded: Arc<FakeShardedConnector>,
    }

    #[async_trait::async_trait]
    impl crate::connector::ConnectorFactory for FakeShardedConnectorFactory {
        async fn connect(&self, _uri: &str) -> Result<Arc<dyn crate::connector::Connector>> {
            Ok(self.sharded.clone())
        }

        async fn connect_to_member(&self, address: &str) -> Result<Arc<dyn crate::connector::Connector>> {
            Ok(Arc::new(FakeConnector::primary(address)))
        }
    }

    // A sharded topology connector can never satisfy fsynclock/suspendIO
    // directly (only a single mongod does), so enabling either against a
    // sharded source is a configuration error rather than a silent no-op.
    #[tokio::test(start_paused = true)]
    async fn sharded_connector_with_fsynclock_enabled_is_a_configuration_error() {
        let store = Arc::new(FakeTaskStore::new());
        let sharded = Arc::new(FakeShardedConnector::new("mongos:27017", Vec::new()));
        let ctx = MbsContext::new(
            crate::config::EngineConfig::default(),
            Arc::new(FakeNotifier::default()),
            Arc::new(FakeBackupAssistant::default()),
            store.clone(),
            Arc::new(FakeShardedConnectorFactory { sharded: sharded.clone() }),
        );
        let (mut backup, _cbs) = snapshot_backup();
        let mut cfg = SnapshotStrategyConfig::default();
        cfg.common.use_fsynclock = Some(true);

        let result = run(&ctx, &mut backup, &cfg).await;
        assert!(matches!(result, Err(MbsError::Configuration(_))));
    }

    #[test]
    fn restore_is_always_unsupported() {
        assert!(restore_unsupported().is_err());
    }
}
