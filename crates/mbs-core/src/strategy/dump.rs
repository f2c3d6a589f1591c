//! Dump strategy (C6, spec §4.5): dump → archive → upload, resumable via
//! the event log, with a failure-dump uploaded even when the dump itself
//! fails.

use std::path::PathBuf;
use std::sync::Arc;

use mbs_errors::{DumpError, Retriable};
use serde::{Deserialize, Serialize};

use crate::assistant::{BackupUpdate, DumpOptions};
use crate::connector::Connector;
use crate::context::MbsContext;
use crate::event::EventType;
use crate::naming;
use crate::quiescence::persist_event;
use crate::retry::{robustify, RetryPolicy};
use crate::task::{Backup, TaskLike};
use crate::{MbsError, Result};

use super::CommonSettings;

pub const START_EXTRACT: &str = "START_EXTRACT";
pub const END_EXTRACT: &str = "END_EXTRACT";
pub const START_ARCHIVE: &str = "START_ARCHIVE";
pub const END_ARCHIVE: &str = "END_ARCHIVE";
pub const START_UPLOAD: &str = "START_UPLOAD";
pub const END_UPLOAD: &str = "END_UPLOAD";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpStrategyConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    /// `dumpUsers != false` (spec §4.5): `None` means "not configured",
    /// which behaves as `true`.
    pub dump_users: Option<bool>,
}

/// spec §4.5: "a resumed dump task reuses its prior connector and stats"
/// once `END_EXTRACT` is logged.
pub fn needs_new_member_selection(backup: &Backup) -> bool {
    !backup.is_event_logged(END_EXTRACT)
}

pub fn needs_new_source_stats(backup: &Backup) -> bool {
    !backup.is_event_logged(END_EXTRACT)
}

async fn log_start_end<F, Fut>(ctx: &MbsContext, backup: &mut Backup, start: &str, end: &str, op: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    if backup.is_event_logged(end) {
        return Ok(());
    }
    persist_event(ctx, backup, crate::event::EventEntry::new(start, EventType::Info)).await?;
    op().await?;
    persist_event(ctx, backup, crate::event::EventEntry::new(end, EventType::Info)).await
}

fn build_dump_options(cfg: &DumpStrategyConfig, connector: &dyn Connector, version_major: u32, version_minor: u32, is_db_level: bool, database_name: Option<String>) -> DumpOptions {
    let mut options = DumpOptions {
        journal: connector.is_config_server(),
        force_table_scan: false,
        oplog: false,
        authentication_database: None,
        dump_db_users_and_roles: false,
        database_name,
    };

    if !is_db_level {
        options.force_table_scan = false; // filled by caller via config flag
        options.oplog = connector.is_replica_member();
    }

    if (version_major, version_minor) >= (2, 4) && connector.has_admin_credentials() {
        options.authentication_database = Some("admin".to_string());
    }

    if (version_major, version_minor) >= (2, 6) && is_db_level && cfg.dump_users != Some(false) {
        options.dump_db_users_and_roles = true;
    }

    options
}

/// The dump phase itself (spec §4.5 step 1): builds options from the
/// connector's version/role, invokes the dump, classifies failure, uploads
/// the log unconditionally, and on failure additionally tars+uploads the
/// dump directory under a `FAILED_` prefix before re-raising.
async fn run_extract(
    ctx: &MbsContext,
    backup: &mut Backup,
    cfg: &DumpStrategyConfig,
    connector: &dyn Connector,
) -> Result<PathBuf> {
    if backup.is_event_logged(END_EXTRACT) {
        // Resumed: dump dir is derived the same way it was computed before.
        return Ok(backup.core.workspace.clone().unwrap_or_default().join("dump"));
    }

    persist_event(ctx, backup, crate::event::EventEntry::new(START_EXTRACT, EventType::Info)).await?;

    let version = connector.mongo_version().await?;
    let is_db_level = backup.source.database_name().is_some();
    let mut uri = backup.source.uri().unwrap_or_default().to_string();
    if let Some(db) = backup.source.database_name() {
        if !uri.contains(db) {
            uri = format!("{uri}/{db}");
        }
    }

    let mut options = build_dump_options(
        cfg,
        connector,
        version.major,
        version.minor,
        is_db_level,
        backup.source.database_name().map(str::to_string),
    );
    if !is_db_level {
        options.force_table_scan = ctx.config.force_table_scan;
    }

    let workspace = backup.core.workspace.clone().ok_or(MbsError::WorkspaceCreation)?;
    let dump_dir = workspace.join("dump");
    let log_file = workspace.join(naming::log_path(&backup.name));

    let attempt_result = robustify(RetryPolicy::DUMP, |_attempt| {
        let uri = uri.clone();
        let dump_dir = dump_dir.clone();
        let log_file = log_file.clone();
        let options = options.clone();
        async move {
            let outcome = ctx.backup_assistant.dump_backup(&uri, &dump_dir, &log_file, &options).await?;
            if outcome.return_code != 0 {
                return Err(MbsError::Dump(mbs_errors::classify_dump_error(
                    outcome.return_code,
                    &outcome.last_log_line,
                )));
            }
            Ok(outcome)
        }
    })
    .await;

    // Upload the dump log regardless of outcome (spec §4.5 step 2).
    let log_upload = ctx
        .backup_assistant
        .upload_backup_log_file(&log_file, backup.target.as_ref(), &naming::log_path(&backup.name))
        .await;
    match log_upload {
        Ok(log_ref) => {
            let mut update = BackupUpdate::with_event(crate::event::EventEntry::new(
                "UPLOADED_DUMP_LOG",
                EventType::Info,
            ));
            update.log_target_reference = Some(Some(log_ref.clone()));
            ctx.task_store.update_backup(&backup.core.id, update).await?;
            backup.log_target_reference = Some(log_ref);
        }
        Err(e) => tracing::warn!(error = %e, "failed to upload dump log file"),
    }

    let outcome = match attempt_result {
        Ok(outcome) => outcome,
        Err(e) => {
            // spec §4.5 step 3: tar+upload the failed dump dir, then re-raise.
            if let Ok(failed_tar) = ctx
                .backup_assistant
                .tar_backup(&dump_dir, &naming::failed_archive_path(&backup.name))
                .await
            {
                if let Err(upload_err) = ctx
                    .backup_assistant
                    .upload_backup(&failed_tar, std::slice::from_ref(&backup.target), &naming::failed_archive_path(&backup.name))
                    .await
                {
                    tracing::warn!(error = %upload_err, "failed to upload failed-dump diagnostics archive");
                }
            }
            return Err(e);
        }
    };

    backup.source_stats.data_size = Some(outcome.data_size_bytes);
    let mut update = BackupUpdate::with_event(crate::event::EventEntry::new(END_EXTRACT, EventType::Info));
    update.source_stats = Some(backup.source_stats.clone());
    ctx.task_store.update_backup(&backup.core.id, update).await?;
    backup.core_mut().events.append(crate::event::EventEntry::new(END_EXTRACT, EventType::Info));

    Ok(outcome.dump_dir)
}

async fn run_archive(ctx: &MbsContext, backup: &mut Backup, dump_dir: &std::path::Path) -> Result<PathBuf> {
    let tar_name = naming::archive_path(&backup.name);
    let workspace = backup.core.workspace.clone().ok_or(MbsError::WorkspaceCreation)?;
    let tar_path = workspace.join(&tar_name);
    if backup.is_event_logged(END_ARCHIVE) {
        return Ok(tar_path);
    }
    let mut result_path = tar_path.clone();
    log_start_end(ctx, backup, START_ARCHIVE, END_ARCHIVE, || async {
        result_path = ctx
            .backup_assistant
            .tar_backup(dump_dir, &tar_name)
            .await
            .map_err(|_| MbsError::Archive)?;
        Ok(())
    })
    .await?;
    Ok(result_path)
}

async fn run_upload(ctx: &MbsContext, backup: &mut Backup, tar_path: &std::path::Path) -> Result<()> {
    if backup.is_event_logged(END_UPLOAD) {
        return Ok(());
    }
    persist_event(ctx, backup, crate::event::EventEntry::new(START_UPLOAD, EventType::Info)).await?;

    let stale_target_reference = backup.target_reference.clone();

    let mut targets: Vec<Arc<dyn crate::assistant::Target>> = vec![backup.target.clone()];
    targets.extend(backup.secondary_targets.iter().cloned());
    let refs = ctx
        .backup_assistant
        .upload_backup(tar_path, &targets, &naming::archive_path(&backup.name))
        .await?;
    let (primary_ref, secondary_refs) = refs
        .split_first()
        .map(|(p, rest)| (p.clone(), rest.to_vec()))
        .ok_or_else(|| MbsError::Configuration("uploadBackup returned no target refs".to_string()))?;

    backup.target_reference = Some(primary_ref.clone());
    backup.secondary_target_references = secondary_refs.clone();

    let mut update = BackupUpdate::with_event(crate::event::EventEntry::new(END_UPLOAD, EventType::Info));
    update.target_reference = Some(Some(primary_ref));
    update.secondary_target_references = Some(secondary_refs);
    ctx.task_store.update_backup(&backup.core.id, update).await?;
    backup.core_mut().events.append(crate::event::EventEntry::new(END_UPLOAD, EventType::Info));

    if let Some(stale_ref) = stale_target_reference {
        if let Err(e) = backup.target.delete_file(&stale_ref).await {
            tracing::warn!(error = %e, "best-effort delete of stale target reference failed");
        }
    }
    Ok(())
}

/// Top-level dump-strategy run: phase sequence + `backupRateInMBPS`
/// computation (spec §4.5).
pub async fn run(ctx: &MbsContext, backup: &mut Backup, cfg: &DumpStrategyConfig) -> Result<()> {
    let connector = super::select_source_connector(ctx, backup, &cfg.common, needs_new_member_selection(backup)).await?;

    let start = std::time::Instant::now();
    let dump_dir = run_extract(ctx, backup, cfg, connector.as_ref()).await?;
    let tar_path = run_archive(ctx, backup, &dump_dir).await?;
    run_upload(ctx, backup, &tar_path).await?;

    if let Some(data_size) = backup.source_stats.data_size {
        let elapsed_seconds = start.elapsed().as_secs_f64().max(0.001);
        let data_size_mb = data_size as f64 / (1024.0 * 1024.0);
        let rate = (data_size_mb / elapsed_seconds * 100.0).round() / 100.0;
        backup.backup_rate_in_mbps = Some(rate);
        let mut update = BackupUpdate::default();
        update.backup_rate_in_mbps = Some(rate);
        ctx.task_store.update_backup(&backup.core.id, update).await.ok();
    }

    Ok(())
}

pub fn classify(return_code: i32, last_log_line: &str) -> (DumpError, bool) {
    let err = mbs_errors::classify_dump_error(return_code, last_log_line);
    let retriable = err.is_retriable();
    (err, retriable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    fn ctx() -> (MbsContext, Arc<FakeTaskStore>, Arc<FakeBackupAssistant>) {
        let store = Arc::new(FakeTaskStore::new());
        let assistant = Arc::new(FakeBackupAssistant::default());
        let ctx = MbsContext::new(
            crate::config::EngineConfig::default(),
            Arc::new(FakeNotifier::default()),
            assistant.clone(),
            store.clone(),
            Arc::new(FakeConnectorFactory::default()),
        );
        (ctx, store, assistant)
    }

    fn dump_backup() -> Backup {
        let mut backup = backup_fixture();
        backup.core.workspace = Some(std::env::temp_dir().join("mbs-dump-test"));
        backup
    }

    #[tokio::test]
    async fn happy_path_records_full_phase_sequence() {
        let (ctx, _store, _assistant) = ctx();
        let mut backup = dump_backup();
        let cfg = DumpStrategyConfig {
            common: CommonSettings::default(),
            dump_users: None,
        };
        run(&ctx, &mut backup, &cfg).await.unwrap();

        assert!(backup.is_event_logged(START_EXTRACT));
        assert!(backup.is_event_logged(END_EXTRACT));
        assert!(backup.is_event_logged(START_ARCHIVE));
        assert!(backup.is_event_logged(END_ARCHIVE));
        assert!(backup.is_event_logged(START_UPLOAD));
        assert!(backup.is_event_logged(END_UPLOAD));
        assert!(backup.target_reference.is_some());
        assert!(backup.backup_rate_in_mbps.is_some());
    }

    #[tokio::test]
    async fn resumed_task_skips_dump_subprocess() {
        let (ctx, _store, assistant) = ctx();
        let mut backup = dump_backup();
        backup.log_info(END_EXTRACT, None);
        backup.source_stats.data_size = Some(100);

        let cfg = DumpStrategyConfig {
            common: CommonSettings::default(),
            dump_users: None,
        };
        run(&ctx, &mut backup, &cfg).await.unwrap();

        assert_eq!(assistant.dump_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(backup.is_event_logged(END_UPLOAD));
    }

    #[test]
    fn classify_matches_retriability_table() {
        let (_, retriable) = classify(1, "error 10334 occurred");
        assert!(retriable);
        let (_, retriable) = classify(245, "anything");
        assert!(!retriable);
    }
}
