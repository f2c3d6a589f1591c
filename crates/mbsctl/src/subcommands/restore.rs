//! `mbsctl restore`: seed a fake dump-strategy backup (so there is something
//! to restore from) and run the restore executor against it.

use std::sync::Arc;

use clap::{Arg, ArgMatches};
use mbs_core::assistant::BackupSnapshot;
use mbs_core::event::{EventEntry, EventLog, EventType};
use mbs_core::strategy::dump;
use mbs_core::task::{Restore, SourceStats, TaskCore};
use mbs_core::test_support::{FakeBackupAssistant, FakeConnectorFactory, FakeNotifier, FakeTarget, FakeTaskStore};

pub fn cli() -> clap::Command {
    clap::Command::new("restore")
        .about("Restore a (seeded) prior dump-strategy backup into a destination")
        .arg(
            Arg::new("source-backup")
                .long("source-backup")
                .default_value("mbsctl-backup")
                .help("Name of the source backup to restore from"),
        )
        .arg(
            Arg::new("destination-uri")
                .long("destination-uri")
                .default_value("mongodb://localhost:27018")
                .help("Connection URI of the restore destination"),
        )
}

pub async fn exec(args: &ArgMatches) -> Result<(), anyhow::Error> {
    let source_backup = args.get_one::<String>("source-backup").cloned().unwrap_or_default();
    let destination_uri = args.get_one::<String>("destination-uri").cloned().unwrap_or_default();

    let store = Arc::new(FakeTaskStore::new());

    let mut source_events = EventLog::new();
    source_events.append(EventEntry::new(dump::START_EXTRACT, EventType::Info));
    source_events.append(EventEntry::new(dump::END_EXTRACT, EventType::Info));

    let source_stats = SourceStats {
        data_size: Some(100 * 1024 * 1024),
        database_name: None,
        version: Some("2.6.0".to_string()),
        has_repl: true,
        extra: Default::default(),
    };

    store.seed_backup(BackupSnapshot {
        id: source_backup.clone(),
        name: source_backup.clone(),
        events: source_events.clone(),
        source_stats: source_stats.clone(),
        target_reference: Some(mbs_core::assistant::TargetRef {
            container: "fake-container".to_string(),
            destination_path: format!("{source_backup}.tgz"),
            size_bytes: Some(100 * 1024 * 1024),
        }),
    });

    let ctx = mbs_core::context::MbsContext::new(
        mbs_core::config::EngineConfig::default(),
        Arc::new(FakeNotifier::default()),
        Arc::new(FakeBackupAssistant::default()),
        store,
        Arc::new(FakeConnectorFactory::default()),
    );

    let mut restore = Restore {
        core: {
            let mut core = TaskCore::new(format!("mbsctl-restore-{source_backup}"));
            core.workspace = Some(std::env::temp_dir().join(format!("mbsctl-restore-{source_backup}")));
            core
        },
        source_backup_name: source_backup.clone(),
        source_backup_events: source_events,
        source_stats,
        destination_uri,
        source_database_name: None,
        source_backup_database_name: None,
        destination_database_name: None,
        destination_stats: SourceStats::default(),
        log_target: Arc::new(FakeTarget::default()),
        log_target_reference: None,
    };

    mbs_core::restore::run(&ctx, &mut restore).await?;

    println!("restore of '{source_backup}' finished");
    println!("destination stats: {:?}", restore.destination_stats);
    println!(
        "events:\n{}",
        serde_json::to_string_pretty(restore.core.events.entries())?
    );
    Ok(())
}
