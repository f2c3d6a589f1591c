//! Artifact naming (spec §6, "Snapshot artifact naming"). Rendering a name
//! from a naming *scheme* (template expansion over backup metadata) is an
//! external collaborator and out of scope (spec §1); this module owns the
//! fixed suffix/prefix conventions this core applies to an already-rendered
//! `backup.name`/`backup.description`, plus the [`NamingScheme`] trait a
//! caller may implement with a real templating engine.

use crate::task::Backup;

/// Renders `backup.name`/`backup.description` from whatever template
/// language a caller wants (cron-style plan metadata, free variables, ...).
/// Not called by this crate's own strategies except where the spec calls
/// for a re-render (snapshot strategy, just before capture, per §3: "may be
/// updated before snapshot capture"); most callers render once up front and
/// never touch this trait again.
pub trait NamingScheme: Send + Sync {
    fn render_name(&self, backup: &Backup) -> String;
    fn render_description(&self, backup: &Backup) -> String;
}

pub fn archive_path(backup_name: &str) -> String {
    format!("{backup_name}.tgz")
}

pub fn log_path(backup_name: &str) -> String {
    format!("{backup_name}.log")
}

/// `FAILED_`-prefixed archive path for a dump that failed after extraction
/// (spec §4.5 step 3): diagnostics are uploaded even though the backup
/// itself did not succeed.
pub fn failed_archive_path(backup_name: &str) -> String {
    format!("FAILED_{backup_name}.tgz")
}

/// `RESTORE_`-prefixed log path, named after the *source* backup rather than
/// the restore task (spec §6).
pub fn restore_log_path(source_backup_name: &str) -> String {
    format!("RESTORE_{source_backup_name}.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_suffixes_and_prefixes() {
        assert_eq!(archive_path("b1"), "b1.tgz");
        assert_eq!(log_path("b1"), "b1.log");
        assert_eq!(failed_archive_path("b1"), "FAILED_b1.tgz");
        assert_eq!(restore_log_path("b1"), "RESTORE_b1.log");
    }
}
