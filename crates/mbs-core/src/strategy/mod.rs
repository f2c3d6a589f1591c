//! The backup strategy state machine (C6/C7/C8): [`StrategyConfig`] is the
//! value-typed, persisted configuration embedded on every [`Backup`] (spec
//! §3, §9 "Strategy embedded in task document"); [`dump`], [`snapshot`], and
//! [`hybrid`] are the phase-sequence executors that read and mutate it.
//!
//! Member selection (C3/C4) is threaded through here rather than in
//! [`crate::selector`] itself, because choosing *which* connector to run a
//! phase sequence against depends on strategy-level settings (member
//! preference, max lag, offline handling) that only this layer has in
//! scope; [`crate::selector`] stays a pure function library over an
//! already-fetched member list.

pub mod dump;
pub mod hybrid;
pub mod snapshot;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::assistant::BackupUpdate;
use crate::connector::Connector;
use crate::context::MbsContext;
use crate::event::EventType;
use crate::selector;
use crate::task::{Backup, BackupMode, MemberPreference, SelectedSource, TaskLike};
use crate::{MbsError, Result};

pub use dump::DumpStrategyConfig;
pub use hybrid::HybridStrategyConfig;
pub use snapshot::SnapshotStrategyConfig;

/// Settings shared by every strategy variant and propagated from a
/// [`hybrid::HybridStrategyConfig`] to whichever child it selects (spec
/// §4.7, "Before returning, propagate shared settings...").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonSettings {
    pub member_preference: MemberPreference,
    pub backup_mode: BackupMode,
    pub ensure_localhost: bool,
    pub max_data_size: Option<u64>,
    pub max_lag_seconds: Option<u64>,
    pub use_suspend_io: Option<bool>,
    pub use_fsynclock: Option<bool>,
    pub allow_offline_backups: bool,
    pub backup_name_scheme: Option<String>,
    pub backup_description_scheme: Option<String>,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            member_preference: MemberPreference::default(),
            backup_mode: BackupMode::default(),
            ensure_localhost: true,
            max_data_size: None,
            max_lag_seconds: None,
            use_suspend_io: None,
            use_fsynclock: None,
            allow_offline_backups: false,
            backup_name_scheme: None,
            backup_description_scheme: None,
        }
    }
}

impl CommonSettings {
    /// `isUseFsynclock`/`isUseSuspendIO` (spec §4.6): fsynclock defaults on
    /// for snapshots; suspend-IO defaults on but additionally requires
    /// fsynclock to be on.
    pub fn use_fsynclock_effective(&self) -> bool {
        self.use_fsynclock != Some(false)
    }

    pub fn use_suspend_io_effective(&self) -> bool {
        self.use_suspend_io != Some(false) && self.use_fsynclock_effective()
    }

    /// Propagates this strategy's shared settings onto `other`, filling in
    /// only fields `other` hasn't set yet (spec §4.7: "propagate shared
    /// settings... name/description schemes if unset").
    pub fn propagate_onto(&self, other: &mut CommonSettings) {
        other.member_preference = self.member_preference;
        other.backup_mode = self.backup_mode;
        other.ensure_localhost = self.ensure_localhost;
        other.max_data_size = self.max_data_size.or(other.max_data_size);
        other.max_lag_seconds = self.max_lag_seconds.or(other.max_lag_seconds);
        other.use_suspend_io = self.use_suspend_io.or(other.use_suspend_io);
        if self.use_fsynclock.is_some() {
            other.use_fsynclock = self.use_fsynclock;
        }
        other.allow_offline_backups = self.allow_offline_backups;
        if other.backup_name_scheme.is_none() {
            other.backup_name_scheme = self.backup_name_scheme.clone();
        }
        if other.backup_description_scheme.is_none() {
            other.backup_description_scheme = self.backup_description_scheme.clone();
        }
    }
}

/// The closed strategy sum (spec §9 "Polymorphism without inheritance"):
/// exactly one variant is ever active for a given backup, tagged so the
/// persisted document round-trips through a stable `_type` (spec §9
/// "Strategy embedded in task document").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "_type")]
pub enum StrategyConfig {
    DumpStrategy(DumpStrategyConfig),
    CloudBlockStorageStrategy(SnapshotStrategyConfig),
    HybridStrategy(HybridStrategyConfig),
}

impl StrategyConfig {
    pub fn common(&self) -> &CommonSettings {
        match self {
            StrategyConfig::DumpStrategy(s) => &s.common,
            StrategyConfig::CloudBlockStorageStrategy(s) => &s.common,
            StrategyConfig::HybridStrategy(s) => &s.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonSettings {
        match self {
            StrategyConfig::DumpStrategy(s) => &mut s.common,
            StrategyConfig::CloudBlockStorageStrategy(s) => &mut s.common,
            StrategyConfig::HybridStrategy(s) => &mut s.common,
        }
    }
}

/// Dispatches to the right phase-sequence executor for `backup.strategy`
/// (the top-level entry point a caller/CLI invokes).
///
/// spec §4.1/§7: "An uncaught exception in a Task run: persist
/// `reschedulable` (computed per §4.1), then propagate to the outer engine."
/// The flag is recomputed fresh here rather than inside each strategy so
/// every strategy variant gets it for free.
pub async fn run_backup(ctx: &MbsContext, backup: &mut Backup) -> Result<()> {
    let result = match backup.strategy.clone() {
        StrategyConfig::DumpStrategy(cfg) => dump::run(ctx, backup, &cfg).await,
        StrategyConfig::CloudBlockStorageStrategy(cfg) => snapshot::run(ctx, backup, &cfg).await,
        StrategyConfig::HybridStrategy(_) => hybrid::run(ctx, backup).await,
    };
    persist_reschedulable_on_failure(ctx, backup, result).await
}

async fn persist_reschedulable_on_failure<T>(ctx: &MbsContext, backup: &Backup, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        let reschedulable = crate::retry::compute_reschedulable(backup.core.try_count, ctx.config.max_no_retries, err);
        let update = BackupUpdate {
            reschedulable: Some(reschedulable),
            ..Default::default()
        };
        if let Err(persist_err) = ctx.task_store.update_backup(&backup.core.id, update).await {
            tracing::warn!(error = %persist_err, "failed to persist reschedulable flag before propagating task error");
        }
    }
    result
}

/// spec §4.3: resolves a concrete connector for this backup's source, given
/// whether the strategy needs a *new* selection (false ⇒ try to rebuild the
/// previously selected member from persisted state).
pub async fn select_source_connector(
    ctx: &MbsContext,
    backup: &mut Backup,
    common: &CommonSettings,
    needs_new_member_selection: bool,
) -> Result<Arc<dyn Connector>> {
    let uri = backup
        .source
        .uri()
        .ok_or_else(|| MbsError::Configuration("source has no uri".to_string()))?
        .to_string();

    if !needs_new_member_selection {
        if let Some(selected) = backup.selected_sources.first().cloned() {
            let connector = ctx.connector_factory.connect_to_member(&selected.address).await?;
            return validate_online(ctx, backup, connector, common, &uri).await;
        }
    }

    let topology_connector = ctx.connector_factory.connect(&uri).await?;

    let connector: Arc<dyn Connector> = if let Some(sharded) = topology_connector.as_sharded() {
        const SHARDED_MAX_LAG_SECONDS: u64 = 5;
        let shard_secondaries = sharded.select_shard_best_secondaries(SHARDED_MAX_LAG_SECONDS).await?;
        let mut selected = Vec::with_capacity(shard_secondaries.len());
        for member in &shard_secondaries {
            let member_connector = ctx.connector_factory.connect_to_member(&member.address).await?;
            if !member_connector.is_online().await {
                return Err(MbsError::NoEligibleMembersFound { uri: uri.clone() });
            }
            selected.push(SelectedSource {
                address: member.address.clone(),
                is_primary: member.is_primary,
            });
        }
        backup.selected_sources = selected;
        topology_connector.clone()
    } else if let Some(rs) = topology_connector.as_replica_set() {
        let members = rs.members().await?;
        let max_lag_seconds = common.max_lag_seconds.unwrap_or(0);
        let result = selector::select_replica_set_member(
            &members,
            common.member_preference,
            max_lag_seconds,
            ctx.config.too_stale_threshold_seconds,
            &uri,
        )?;
        for warning in &result.warnings {
            backup.log_warning(warning.event_name, warning.message.clone());
        }
        let member_connector = ctx.connector_factory.connect_to_member(&result.address).await?;
        backup.selected_sources = vec![SelectedSource {
            address: result.address,
            is_primary: result.is_primary,
        }];
        member_connector
    } else {
        backup.selected_sources = vec![SelectedSource {
            address: topology_connector.address().to_string(),
            is_primary: topology_connector.is_primary().await.unwrap_or(false),
        }];
        topology_connector.clone()
    };

    validate_online(ctx, backup, connector, common, &uri).await
}

/// spec §4.3 "Validation step": if the chosen connector is offline, either
/// flip the backup mode to OFFLINE (persisting the flip) or fail, depending
/// on `allowOfflineBackups` and the current mode.
async fn validate_online(
    ctx: &MbsContext,
    backup: &mut Backup,
    connector: Arc<dyn Connector>,
    common: &CommonSettings,
    uri: &str,
) -> Result<Arc<dyn Connector>> {
    if connector.is_online().await {
        return Ok(connector);
    }
    let currently_online = common.backup_mode == BackupMode::Online;
    let should_be_offline = selector::resolve_offline_selection(common.allow_offline_backups, currently_online, uri)?;
    if should_be_offline && currently_online {
        backup.strategy.common_mut().backup_mode = BackupMode::Offline;
        let entry = crate::event::EventEntry::new("BACKUP_MODE_OFFLINE", EventType::Warning)
            .with_message("connector is offline; switching backup mode to OFFLINE");
        crate::quiescence::persist_event(ctx, backup, entry).await?;
    }
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn failure_persists_reschedulable_before_propagating() {
        let store = Arc::new(FakeTaskStore::new());
        let ctx = MbsContext::new(
            crate::config::EngineConfig::default(),
            Arc::new(FakeNotifier::default()),
            Arc::new(FakeBackupAssistant::default()),
            store.clone(),
            Arc::new(FakeConnectorFactory::default()),
        );
        let backup = backup_fixture();

        let result: Result<()> = Err(MbsError::Extract); // non-retriable
        let err = persist_reschedulable_on_failure(&ctx, &backup, result).await.unwrap_err();
        assert!(matches!(err, MbsError::Extract));

        let updates = store.backup_updates.lock().unwrap();
        let reschedulable_update = updates.iter().find(|u| u.reschedulable.is_some()).expect("reschedulable was persisted");
        assert_eq!(reschedulable_update.reschedulable, Some(false));
    }

    #[test]
    fn common_settings_effective_flags_default_on() {
        let common = CommonSettings::default();
        assert!(common.use_fsynclock_effective());
        assert!(common.use_suspend_io_effective());
    }

    #[test]
    fn explicit_false_disables_suspend_io_even_if_unset_for_fsynclock() {
        let mut common = CommonSettings::default();
        common.use_suspend_io = Some(false);
        assert!(common.use_fsynclock_effective());
        assert!(!common.use_suspend_io_effective());
    }

    #[test]
    fn fsynclock_false_implies_suspend_io_false() {
        let mut common = CommonSettings::default();
        common.use_fsynclock = Some(false);
        assert!(!common.use_fsynclock_effective());
        assert!(!common.use_suspend_io_effective());
    }

    #[test]
    fn propagate_fills_only_unset_fields() {
        let mut parent = CommonSettings::default();
        parent.member_preference = MemberPreference::PrimaryOnly;
        parent.backup_name_scheme = Some("parent-scheme".to_string());

        let mut child = CommonSettings::default();
        child.backup_name_scheme = Some("child-scheme".to_string());

        parent.propagate_onto(&mut child);
        assert_eq!(child.member_preference, MemberPreference::PrimaryOnly);
        // child's own scheme wins since it was already set.
        assert_eq!(child.backup_name_scheme.as_deref(), Some("child-scheme"));
    }
}
