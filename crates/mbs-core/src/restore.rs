//! The restore executor (C9, spec §4.8): download the source backup's
//! archive, extract it, assemble `mongorestore` options for the destination,
//! and run it.
//!
//! Restore only ever supports a backup produced by the dump strategy: a
//! cloud block-storage snapshot has no archive to download, so a restore
//! whose source backup never logged [`crate::strategy::dump::END_EXTRACT`]
//! is routed to [`crate::strategy::snapshot::restore_unsupported`] instead of
//! attempting anything here.

use std::path::PathBuf;

use crate::assistant::{RestoreOptions, RestoreUpdate};
use crate::connector::MongoVersion;
use crate::context::MbsContext;
use crate::event::{EventEntry, EventType};
use crate::naming;
use crate::retry::{robustify, RetryPolicy};
use crate::strategy::{dump, snapshot};
use crate::task::{Restore, SourceStats, TaskLike};
use crate::{MbsError, Result};

pub const START_DOWNLOAD_BACKUP: &str = "START_DOWNLOAD_BACKUP";
pub const END_DOWNLOAD_BACKUP: &str = "END_DOWNLOAD_BACKUP";
pub const START_EXTRACT_BACKUP: &str = "START_EXTRACT_BACKUP";
pub const END_EXTRACT_BACKUP: &str = "END_EXTRACT_BACKUP";
pub const START_RESTORE_DUMP: &str = "START_RESTORE_DUMP";
pub const END_RESTORE_DUMP: &str = "END_RESTORE_DUMP";

/// Appends `entry` to `restore`'s in-memory log and persists it through the
/// context's `TaskStore`, mirroring [`crate::quiescence::persist_event`] for
/// the restore side of the update contract (spec §4.2).
async fn persist_event(ctx: &MbsContext, restore: &mut Restore, entry: EventEntry) -> Result<()> {
    restore.core_mut().events.append(entry.clone());
    let update = RestoreUpdate::with_event(entry);
    crate::assistant::guard_nonempty_restore_update(ctx.notifier.as_ref(), &update).await?;
    ctx.task_store.update_restore(&restore.core().id, update).await
}

/// Parses a `"major.minor.patch"` version string, defaulting unparsable or
/// missing components to zero. Best-effort: `sourceStats.version` is
/// whatever the source connector reported at backup time, not something this
/// executor controls the shape of.
fn parse_version(version: &str) -> MongoVersion {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    MongoVersion::new(
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// spec §4.8 "Restore option assembly": `sourceDatabaseName` precedence is
/// an explicit override on the restore task itself, else the originating
/// `BackupSource`'s configured database name (as it was at backup time),
/// else whatever database name the source backup's stats recorded.
fn resolve_source_database_name(restore: &Restore) -> Option<String> {
    restore
        .source_database_name
        .clone()
        .or_else(|| restore.source_backup_database_name.clone())
        .or_else(|| restore.source_stats.database_name.clone())
}

/// If `destination_uri` has no trailing database segment, append the
/// destination-level configured database; if it still has none, append the
/// resolved source database instead. Only one of the two ever applies,
/// matching mongorestore's own convention of reading the target database
/// from the connection string.
fn destination_uri_with_database(
    destination_uri: &str,
    destination_database_name: Option<&str>,
    source_database_name: Option<&str>,
) -> String {
    fn has_database(uri: &str) -> bool {
        uri.rsplit('/')
            .next()
            .map(|tail| !tail.is_empty() && !tail.contains(':'))
            .unwrap_or(false)
    }

    let mut uri = destination_uri.to_string();
    if !has_database(&uri) {
        if let Some(db) = destination_database_name {
            uri = format!("{}/{}", uri.trim_end_matches('/'), db);
        }
    }
    if !has_database(&uri) {
        if let Some(db) = source_database_name {
            uri = format!("{}/{}", uri.trim_end_matches('/'), db);
        }
    }
    uri
}

fn build_restore_options(
    ctx: &MbsContext,
    restore: &Restore,
    source_database_name: Option<&str>,
    dest_version: &MongoVersion,
    dest_kind: crate::connector::ConnectorKind,
) -> RestoreOptions {
    use crate::connector::ConnectorKind;

    let is_db_level = source_database_name.is_some();
    RestoreOptions {
        oplog_replay: !is_db_level && restore.source_stats.has_repl,
        authentication_database: (dest_version.at_least(2, 4)
            && matches!(dest_kind, ConnectorKind::Server | ConnectorKind::Cluster))
        .then(|| "admin".to_string()),
        restore_db_users_and_roles: dest_version.at_least(2, 6) && is_db_level,
        no_index_restore: ctx.config.no_index_restore,
    }
}

/// spec §4.8 "System-user file cleanup": whether to delete the dumped
/// `admin.system.users`/`<db>.system.users` file before restoring, keyed off
/// the source/destination version straddling the Mongo 2.6 users-collection
/// format change.
fn system_user_cleanup_flags(source_version: &MongoVersion, dest_version: &MongoVersion) -> (bool, bool) {
    let delete_old_admin_users_file = source_version.major < 2 || (source_version.major == 2 && source_version.minor < 6);
    let delete_old_admin_users_file = delete_old_admin_users_file && dest_version.at_least(2, 6);
    let delete_old_users_file =
        delete_old_admin_users_file || (source_version.at_least(2, 6) && dest_version.at_least(2, 6));
    (delete_old_admin_users_file, delete_old_users_file)
}

async fn run_download(ctx: &MbsContext, restore: &mut Restore) -> Result<PathBuf> {
    let workspace = restore.core.workspace.clone().ok_or(MbsError::WorkspaceCreation)?;
    let archive_dest = workspace.join("restore-source.tgz");
    if restore.is_event_logged(END_DOWNLOAD_BACKUP) {
        return Ok(archive_dest);
    }

    let snapshot = ctx
        .task_store
        .get_backup(&restore.source_backup_name)
        .await?
        .ok_or_else(|| MbsError::Configuration(format!("source backup '{}' no longer exists", restore.source_backup_name)))?;
    let target_reference = snapshot
        .target_reference
        .ok_or_else(|| MbsError::Configuration(format!("source backup '{}' has no target reference", restore.source_backup_name)))?;

    persist_event(ctx, restore, EventEntry::new(START_DOWNLOAD_BACKUP, EventType::Info)).await?;
    let downloaded = ctx
        .backup_assistant
        .download_restore_source_backup(&target_reference, &archive_dest)
        .await?;
    persist_event(ctx, restore, EventEntry::new(END_DOWNLOAD_BACKUP, EventType::Info)).await?;
    Ok(downloaded)
}

async fn run_extract(ctx: &MbsContext, restore: &mut Restore, archive_path: &std::path::Path) -> Result<PathBuf> {
    if restore.is_event_logged(END_EXTRACT_BACKUP) {
        let workspace = restore.core.workspace.clone().unwrap_or_default();
        return Ok(workspace.join("restore-source"));
    }

    persist_event(ctx, restore, EventEntry::new(START_EXTRACT_BACKUP, EventType::Info)).await?;
    let dump_dir = ctx
        .backup_assistant
        .extract_restore_source_backup(archive_path)
        .await
        .map_err(|_| MbsError::Extract)?;
    persist_event(ctx, restore, EventEntry::new(END_EXTRACT_BACKUP, EventType::Info)).await?;
    Ok(dump_dir)
}

async fn run_mongo_restore(ctx: &MbsContext, restore: &mut Restore, dump_dir: &std::path::Path) -> Result<()> {
    if restore.is_event_logged(END_RESTORE_DUMP) {
        return Ok(());
    }

    let source_database_name = resolve_source_database_name(restore);
    let destination_uri = destination_uri_with_database(
        &restore.destination_uri,
        restore.destination_database_name.as_deref(),
        source_database_name.as_deref(),
    );

    let dest_connector = ctx.connector_factory.connect(&destination_uri).await?;
    let dest_version = dest_connector.mongo_version().await?;
    let source_version = parse_version(restore.source_stats.version.as_deref().unwrap_or("0.0.0"));

    let options = build_restore_options(
        ctx,
        restore,
        source_database_name.as_deref(),
        &dest_version,
        dest_connector.kind(),
    );
    let (delete_old_admin_users_file, delete_old_users_file) =
        system_user_cleanup_flags(&source_version, &dest_version);

    if dest_version.at_least(2, 6) {
        dest_connector.grant_role("admin", "restore").await?;
    }

    let workspace = restore.core.workspace.clone().ok_or(MbsError::WorkspaceCreation)?;
    let log_file = workspace.join(naming::restore_log_path(&restore.source_backup_name));

    persist_event(ctx, restore, EventEntry::new(START_RESTORE_DUMP, EventType::Info)).await?;

    let outcome = robustify(RetryPolicy::DUMP, |_attempt| {
        let destination_uri = destination_uri.clone();
        let source_database_name = source_database_name.clone();
        let log_file = log_file.clone();
        let options = options.clone();
        async {
            let outcome = ctx
                .backup_assistant
                .run_mongo_restore(
                    &destination_uri,
                    dump_dir,
                    source_database_name.as_deref(),
                    &log_file,
                    delete_old_admin_users_file,
                    delete_old_users_file,
                    &options,
                )
                .await?;
            if outcome.return_code != 0 {
                return Err(MbsError::Restore(mbs_errors::RestoreError {
                    return_code: outcome.return_code,
                    last_log_line: outcome.last_log_line,
                }));
            }
            Ok(outcome)
        }
    })
    .await;

    let log_upload = ctx
        .backup_assistant
        .upload_backup_log_file(
            &log_file,
            restore.log_target.as_ref(),
            &naming::restore_log_path(&restore.source_backup_name),
        )
        .await;
    match log_upload {
        Ok(log_ref) => {
            let update = RestoreUpdate {
                log_target_reference: Some(Some(log_ref.clone())),
                ..Default::default()
            };
            ctx.task_store.update_restore(&restore.core.id, update).await?;
            restore.log_target_reference = Some(log_ref);
        }
        Err(e) => tracing::warn!(error = %e, "failed to upload restore log file"),
    }

    let _outcome = outcome?;
    persist_event(ctx, restore, EventEntry::new(END_RESTORE_DUMP, EventType::Info)).await
}

async fn compute_destination_stats(ctx: &MbsContext, restore: &mut Restore) -> Result<()> {
    let destination_uri = destination_uri_with_database(
        &restore.destination_uri,
        restore.destination_database_name.as_deref(),
        resolve_source_database_name(restore).as_deref(),
    );
    let connector = ctx.connector_factory.connect(&destination_uri).await?;
    let database_name = resolve_source_database_name(restore);
    let stats = connector.stats(database_name.as_deref()).await?;

    let destination_stats = SourceStats {
        data_size: stats.get("dataSize").and_then(|v| v.as_u64()),
        database_name,
        version: connector.mongo_version().await.ok().map(|v| format!("{}.{}.{}", v.major, v.minor, v.patch)),
        has_repl: false,
        extra: Default::default(),
    };
    restore.destination_stats = destination_stats.clone();

    let update = RestoreUpdate {
        destination_stats: Some(destination_stats),
        ..Default::default()
    };
    ctx.task_store.update_restore(&restore.core.id, update).await
}

/// Top-level restore run (spec §4.8): routes non-dump-backed sources to
/// [`snapshot::restore_unsupported`], otherwise downloads, extracts, runs
/// `mongorestore`, and persists destination stats.
///
/// spec §4.1/§7: on any failure, persists `reschedulable` before the error
/// propagates to the outer engine.
pub async fn run(ctx: &MbsContext, restore: &mut Restore) -> Result<()> {
    let result = run_inner(ctx, restore).await;
    if let Err(err) = &result {
        let reschedulable = crate::retry::compute_reschedulable(restore.core.try_count, ctx.config.max_no_retries, err);
        let update = RestoreUpdate {
            reschedulable: Some(reschedulable),
            ..Default::default()
        };
        if let Err(persist_err) = ctx.task_store.update_restore(&restore.core.id, update).await {
            tracing::warn!(error = %persist_err, "failed to persist reschedulable flag before propagating task error");
        }
    }
    result
}

async fn run_inner(ctx: &MbsContext, restore: &mut Restore) -> Result<()> {
    if !restore.source_backup_events.contains(dump::END_EXTRACT) {
        return snapshot::restore_unsupported();
    }

    let archive_path = run_download(ctx, restore).await?;
    let dump_dir = run_extract(ctx, restore, &archive_path).await?;
    run_mongo_restore(ctx, restore, &dump_dir).await?;
    compute_destination_stats(ctx, restore).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::BackupSnapshot;
    use crate::event::EventLog;
    use crate::task::TaskCore;
    use crate::test_support::*;
    use std::sync::Arc;

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

    fn dump_backed_restore(store: &FakeTaskStore) -> Restore {
        let mut source_events = EventLog::new();
        source_events.append(EventEntry::new(dump::START_EXTRACT, EventType::Info));
        source_events.append(EventEntry::new(dump::END_EXTRACT, EventType::Info));

        store.seed_backup(BackupSnapshot {
            id: "backup-1".to_string(),
            name: "backup-1".to_string(),
            events: source_events.clone(),
            source_stats: SourceStats {
                data_size: Some(1024),
                database_name: Some("orders".to_string()),
                version: Some("2.4.0".to_string()),
                has_repl: false,
                extra: Default::default(),
            },
            target_reference: Some(crate::assistant::TargetRef {
                container: "fake-container".to_string(),
                destination_path: "backup-1.tgz".to_string(),
                size_bytes: Some(1024),
            }),
        });

        Restore {
            core: {
                let mut core = TaskCore::new("restore-1");
                core.workspace = Some(std::env::temp_dir().join("mbs-restore-test"));
                core
            },
            source_backup_name: "backup-1".to_string(),
            source_backup_events: source_events,
            source_stats: SourceStats {
                data_size: Some(1024),
                database_name: Some("orders".to_string()),
                version: Some("2.4.0".to_string()),
                has_repl: false,
                extra: Default::default(),
            },
            destination_uri: "mongodb://dest:27017".to_string(),
            source_database_name: None,
            source_backup_database_name: None,
            destination_database_name: None,
            destination_stats: SourceStats::default(),
            log_target: Arc::new(FakeTarget::default()),
            log_target_reference: None,
        }
    }

    #[tokio::test]
    async fn dump_backed_restore_runs_full_phase_sequence() {
        let (ctx, _store, assistant) = ctx();
        let store_for_seed = Arc::new(FakeTaskStore::new());
        let mut restore = dump_backed_restore(&store_for_seed);
        // Route the restore's own context at the store that actually holds
        // the seeded backup.
        let ctx = MbsContext {
            task_store: store_for_seed.clone(),
            ..ctx
        };

        run(&ctx, &mut restore).await.unwrap();

        assert!(restore.is_event_logged(START_DOWNLOAD_BACKUP));
        assert!(restore.is_event_logged(END_DOWNLOAD_BACKUP));
        assert!(restore.is_event_logged(START_EXTRACT_BACKUP));
        assert!(restore.is_event_logged(END_EXTRACT_BACKUP));
        assert!(restore.is_event_logged(START_RESTORE_DUMP));
        assert!(restore.is_event_logged(END_RESTORE_DUMP));
        assert!(restore.destination_stats.data_size.is_some());
        assert_eq!(assistant.dump_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn snapshot_backed_source_is_unsupported() {
        let (ctx, store, _assistant) = ctx();
        let mut restore = dump_backed_restore(&store);
        // No END_EXTRACT recorded: this restore's source was never a dump.
        restore.source_backup_events = EventLog::new();

        let err = run(&ctx, &mut restore).await.unwrap_err();
        assert!(matches!(err, MbsError::Configuration(_)));
    }

    #[tokio::test]
    async fn failure_persists_reschedulable_before_propagating() {
        let (ctx, store, _assistant) = ctx();
        let mut restore = dump_backed_restore(&store);
        restore.source_backup_events = EventLog::new();

        run(&ctx, &mut restore).await.unwrap_err();

        let updates = store.restore_updates.lock().unwrap();
        let reschedulable_update = updates.iter().find(|u| u.reschedulable.is_some()).expect("reschedulable was persisted");
        // Configuration errors are not retriable, so tryCount < max doesn't matter.
        assert_eq!(reschedulable_update.reschedulable, Some(false));
    }

    #[test]
    fn restore_option_assembly_matches_version_table() {
        let ctx = MbsContext::new(
            crate::config::EngineConfig::default(),
            Arc::new(FakeNotifier::default()),
            Arc::new(FakeBackupAssistant::default()),
            Arc::new(FakeTaskStore::new()),
            Arc::new(FakeConnectorFactory::default()),
        );
        let restore = Restore {
            core: TaskCore::new("r"),
            source_backup_name: "b".to_string(),
            source_backup_events: EventLog::new(),
            source_stats: SourceStats {
                data_size: None,
                database_name: None,
                version: Some("2.4.0".to_string()),
                has_repl: true,
                extra: Default::default(),
            },
            destination_uri: "mongodb://dest:27017".to_string(),
            source_database_name: None,
            source_backup_database_name: None,
            destination_database_name: None,
            destination_stats: SourceStats::default(),
            log_target: Arc::new(FakeTarget::default()),
            log_target_reference: None,
        };
        let dest_version = MongoVersion::new(2, 6, 0);

        let options = build_restore_options(
            &ctx,
            &restore,
            None,
            &dest_version,
            crate::connector::ConnectorKind::Server,
        );
        assert!(options.oplog_replay);
        assert_eq!(options.authentication_database.as_deref(), Some("admin"));
        assert!(!options.restore_db_users_and_roles);

        // Sharded destinations never get --authenticationDatabase, per P7.
        let sharded_options = build_restore_options(
            &ctx,
            &restore,
            None,
            &dest_version,
            crate::connector::ConnectorKind::Sharded,
        );
        assert_eq!(sharded_options.authentication_database, None);
    }

    #[test]
    fn system_user_cleanup_flags_match_version_straddle() {
        let source = MongoVersion::new(2, 4, 0);
        let dest = MongoVersion::new(2, 6, 0);
        let (delete_admin, delete_users) = system_user_cleanup_flags(&source, &dest);
        assert!(delete_admin);
        assert!(delete_users);

        let source = MongoVersion::new(2, 6, 0);
        let (delete_admin, delete_users) = system_user_cleanup_flags(&source, &dest);
        assert!(!delete_admin);
        assert!(delete_users);

        let source = MongoVersion::new(2, 2, 0);
        let dest = MongoVersion::new(2, 4, 0);
        let (delete_admin, delete_users) = system_user_cleanup_flags(&source, &dest);
        assert!(!delete_admin);
        assert!(!delete_users);
    }

    #[test]
    fn destination_uri_gains_source_database_when_missing() {
        assert_eq!(
            destination_uri_with_database("mongodb://dest:27017", None, Some("orders")),
            "mongodb://dest:27017/orders"
        );
        assert_eq!(
            destination_uri_with_database("mongodb://dest:27017/already", None, Some("orders")),
            "mongodb://dest:27017/already"
        );
        assert_eq!(
            destination_uri_with_database("mongodb://dest:27017", None, None),
            "mongodb://dest:27017"
        );
    }

    #[test]
    fn destination_level_database_takes_precedence_over_source_database() {
        assert_eq!(
            destination_uri_with_database("mongodb://dest:27017", Some("reports"), Some("orders")),
            "mongodb://dest:27017/reports"
        );
        assert_eq!(
            destination_uri_with_database("mongodb://dest:27017/already", Some("reports"), Some("orders")),
            "mongodb://dest:27017/already"
        );
    }

    #[test]
    fn resolve_source_database_name_precedence() {
        let mut restore = dump_backed_restore(&FakeTaskStore::new());
        restore.source_database_name = None;
        restore.source_backup_database_name = None;
        restore.source_stats.database_name = Some("from-stats".to_string());
        assert_eq!(resolve_source_database_name(&restore).as_deref(), Some("from-stats"));

        restore.source_backup_database_name = Some("from-backup-source".to_string());
        assert_eq!(resolve_source_database_name(&restore).as_deref(), Some("from-backup-source"));

        restore.source_database_name = Some("explicit".to_string());
        assert_eq!(resolve_source_database_name(&restore).as_deref(), Some("explicit"));
    }
}
