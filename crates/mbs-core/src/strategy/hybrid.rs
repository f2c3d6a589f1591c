//! Hybrid strategy (C8, spec §4.7): wraps one dump and one snapshot child,
//! picks between them once via [`DataSizePredicate`]-style sizing, persists
//! the pick, and delegates everything else to whichever child it chose.

use serde::{Deserialize, Serialize};

use crate::assistant::BackupUpdate;
use crate::connector::Connector;
use crate::context::MbsContext;
use crate::task::{Backup, BackupMode, TaskLike};
use crate::{MbsError, Result};

use super::{dump, snapshot, CommonSettings, DumpStrategyConfig, SnapshotStrategyConfig, StrategyConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SelectedStrategyType {
    Dump,
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridStrategyConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    pub dump: DumpStrategyConfig,
    pub snapshot: SnapshotStrategyConfig,
    #[serde(default)]
    pub selected_strategy_type: Option<SelectedStrategyType>,
}

/// spec §4.7: only true if *both* children report true — a fresh selection
/// is needed only once neither dump nor snapshot has any progress recorded.
pub fn needs_new_member_selection(backup: &Backup) -> bool {
    dump::needs_new_member_selection(backup) && snapshot::needs_new_member_selection(backup)
}

pub fn needs_new_source_stats(backup: &Backup) -> bool {
    dump::needs_new_source_stats(backup) && snapshot::needs_new_source_stats(backup)
}

async fn data_size_predicate(connector: &dyn Connector, database_name: Option<&str>) -> Result<u64> {
    let stats = connector.stats(database_name).await?;
    Ok(stats.get("dataSize").and_then(|v| v.as_u64()).unwrap_or(0))
}

/// spec §4.7's `DataSizePredicate` plus the offline short-circuit ahead of
/// it: offline backups always go to the snapshot child, since a dump
/// requires a live connection to run `mongodump` against.
async fn select_strategy_type(
    ctx: &MbsContext,
    backup: &mut Backup,
    cfg: &HybridStrategyConfig,
) -> Result<SelectedStrategyType> {
    let uri = backup
        .source
        .uri()
        .ok_or_else(|| MbsError::Configuration("source has no uri".to_string()))?
        .to_string();
    let connector = ctx.connector_factory.connect(&uri).await?;

    let offline = cfg.common.backup_mode == BackupMode::Offline
        || (cfg.common.allow_offline_backups && !connector.is_online().await);
    if offline {
        return Ok(SelectedStrategyType::Snapshot);
    }

    let max_data_size = cfg.common.max_data_size.unwrap_or(ctx.config.dump_max_data_size_bytes);
    let data_size = data_size_predicate(connector.as_ref(), backup.source.database_name()).await?;
    if data_size < max_data_size {
        return Ok(SelectedStrategyType::Dump);
    }

    if backup.source.block_storage_by_address(connector.address()).is_none() {
        backup.log_warning(
            "NO_CLOUD_BLOCK_STORAGE",
            "data size exceeds dumpMaxDataSize but no cloud block storage is configured for this source; falling back to dump",
        );
        return Ok(SelectedStrategyType::Dump);
    }

    Ok(SelectedStrategyType::Snapshot)
}

async fn persist_strategy(ctx: &MbsContext, backup: &mut Backup, cfg: &HybridStrategyConfig) -> Result<()> {
    backup.strategy = StrategyConfig::HybridStrategy(cfg.clone());
    let mut update = BackupUpdate::default();
    update.strategy = Some(backup.strategy.clone());
    ctx.task_store.update_backup(&backup.core.id, update).await
}

/// Top-level hybrid-strategy run: select (once, persisted) then delegate.
/// Takes `backup.strategy` directly rather than a separately threaded config,
/// since it both reads and rewrites that field (spec §9 "Strategy embedded
/// in task document").
pub async fn run(ctx: &MbsContext, backup: &mut Backup) -> Result<()> {
    let StrategyConfig::HybridStrategy(mut cfg) = backup.strategy.clone() else {
        return Err(MbsError::Configuration(
            "hybrid::run called on a backup whose strategy is not HybridStrategy".to_string(),
        ));
    };

    let selected = match cfg.selected_strategy_type {
        Some(selected) => selected,
        None => {
            let selected = select_strategy_type(ctx, backup, &cfg).await?;
            cfg.selected_strategy_type = Some(selected);
            persist_strategy(ctx, backup, &cfg).await?;
            selected
        }
    };

    match selected {
        SelectedStrategyType::Dump => {
            let mut child = cfg.dump.clone();
            cfg.common.propagate_onto(&mut child.common);
            dump::run(ctx, backup, &child).await
        }
        SelectedStrategyType::Snapshot => {
            let mut child = cfg.snapshot.clone();
            cfg.common.propagate_onto(&mut child.common);
            snapshot::run(ctx, backup, &child).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CloudBlockStorageConfig, MongoSource};
    use crate::test_support::*;
    use std::sync::Arc;

    fn ctx_with_data_size(data_size: u64) -> (MbsContext, Arc<FakeTaskStore>) {
        let store = Arc::new(FakeTaskStore::new());
        let ctx = MbsContext::new(
            crate::config::EngineConfig::default(),
            Arc::new(FakeNotifier::default()),
            Arc::new(FakeBackupAssistant::default()),
            store.clone(),
            Arc::new(FakeConnectorFactoryWithStats { data_size }),
        );
        (ctx, store)
    }

    fn hybrid_backup(cbs: CloudBlockStorageConfig) -> Backup {
        let mut backup = backup_fixture();
        backup.source = Arc::new(MongoSource {
            uri: "mongodb://p:27017".to_string(),
            database_name: None,
            cloud_block_storage: cbs,
        });
        backup.strategy = StrategyConfig::HybridStrategy(HybridStrategyConfig {
            common: CommonSettings::default(),
            dump: DumpStrategyConfig {
                common: CommonSettings::default(),
                dump_users: None,
            },
            snapshot: SnapshotStrategyConfig::default(),
            selected_strategy_type: None,
        });
        backup.core.workspace = Some(std::env::temp_dir().join("mbs-hybrid-test"));
        backup
    }

    #[tokio::test]
    async fn small_data_size_selects_dump_and_persists_choice() {
        let (ctx, store) = ctx_with_data_size(1024);
        let mut backup = hybrid_backup(CloudBlockStorageConfig::None);
        run(&ctx, &mut backup).await.unwrap();

        let StrategyConfig::HybridStrategy(cfg) = &backup.strategy else {
            panic!("expected hybrid strategy");
        };
        assert_eq!(cfg.selected_strategy_type, Some(SelectedStrategyType::Dump));
        assert!(store
            .backup_updates
            .lock()
            .unwrap()
            .iter()
            .any(|u| u.strategy.is_some()));
        assert!(backup.is_event_logged(dump::END_EXTRACT));
    }

    #[tokio::test]
    async fn large_data_size_without_cbs_falls_back_to_dump_with_warning() {
        let (ctx, _store) = ctx_with_data_size(100 * 1024 * 1024 * 1024);
        let mut backup = hybrid_backup(CloudBlockStorageConfig::None);
        run(&ctx, &mut backup).await.unwrap();

        let StrategyConfig::HybridStrategy(cfg) = &backup.strategy else {
            panic!("expected hybrid strategy");
        };
        assert_eq!(cfg.selected_strategy_type, Some(SelectedStrategyType::Dump));
        assert!(backup.is_event_logged("NO_CLOUD_BLOCK_STORAGE"));
    }

    #[tokio::test(start_paused = true)]
    async fn large_data_size_with_cbs_selects_snapshot() {
        let (ctx, _store) = ctx_with_data_size(100 * 1024 * 1024 * 1024);
        let cbs = Arc::new(FakeCloudBlockStorage::new("vol-a"));
        *cbs.status.lock().unwrap() = crate::source::SnapshotStatus::Completed;
        let mut backup = hybrid_backup(CloudBlockStorageConfig::Single(cbs));
        run(&ctx, &mut backup).await.unwrap();

        let StrategyConfig::HybridStrategy(cfg) = &backup.strategy else {
            panic!("expected hybrid strategy");
        };
        assert_eq!(cfg.selected_strategy_type, Some(SelectedStrategyType::Snapshot));
        assert!(backup.is_event_logged(snapshot::END_BLOCK_STORAGE_SNAPSHOT));
    }

    #[tokio::test]
    async fn offline_mode_always_selects_snapshot() {
        let (ctx, _store) = ctx_with_data_size(1024);
        let cbs = Arc::new(FakeCloudBlockStorage::new("vol-a"));
        *cbs.status.lock().unwrap() = crate::source::SnapshotStatus::Completed;
        let mut backup = hybrid_backup(CloudBlockStorageConfig::Single(cbs));
        let StrategyConfig::HybridStrategy(ref mut cfg) = backup.strategy else {
            unreachable!()
        };
        cfg.common.backup_mode = BackupMode::Offline;

        run(&ctx, &mut backup).await.unwrap();
        let StrategyConfig::HybridStrategy(cfg) = &backup.strategy else {
            panic!("expected hybrid strategy");
        };
        assert_eq!(cfg.selected_strategy_type, Some(SelectedStrategyType::Snapshot));
    }

    #[test]
    fn needs_new_selection_only_true_if_both_children_fresh() {
        let mut backup = hybrid_backup(CloudBlockStorageConfig::None);
        assert!(needs_new_member_selection(&backup));

        backup.log_info(dump::END_EXTRACT, None);
        // dump is done, snapshot still fresh: AND is false.
        assert!(!needs_new_member_selection(&backup));
    }
}
