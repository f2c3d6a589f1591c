//! Engine tunables. Loading this from a file or environment is an external
//! collaborator's job (spec §1); this module only specifies the shape and
//! defaults so the engine can run without a recompile once wired up by a
//! caller.

use serde::{Deserialize, Serialize};

/// How many times a reschedulable task may be re-attempted before it is
/// abandoned (spec §4.1).
pub const MAX_NO_RETRIES: u32 = 3;

/// Ceiling on how long the source may stay locked/IO-suspended before the
/// watchdog forces a release (spec §4.4).
pub const MAX_LOCK_TIME_SECONDS: u64 = 60;

/// Ceiling on how long the coordinator waits for the balancer to report
/// stopped before giving up (spec §4.4). The original comments this as "10
/// minutes" but computes 30*60; the computed value (1800s = 30 minutes)
/// governs (spec §9).
pub const MAX_BALANCER_STOP_WAIT_SECONDS: u64 = 1800;

/// How long to wait, after resuming it, for the balancer to report active
/// again (spec §4.4 step 4).
pub const BALANCER_RESUME_POLL_SECONDS: u64 = 30;

/// Poll interval while waiting for a snapshot to leave PENDING (spec §4.6).
pub const SNAPSHOT_PENDING_POLL_SECONDS: u64 = 5;

/// Poll interval while waiting for a snapshot to reach a terminal status
/// (spec §4.6).
pub const SNAPSHOT_TERMINAL_POLL_SECONDS: u64 = 60;

/// Poll interval while waiting for the balancer to stop (spec §4.4 step 1).
pub const BALANCER_STOP_POLL_SECONDS: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub max_no_retries: u32,
    pub max_lock_time_seconds: u64,
    pub max_balancer_stop_wait_seconds: u64,
    pub balancer_resume_poll_seconds: u64,
    pub snapshot_pending_poll_seconds: u64,
    pub snapshot_terminal_poll_seconds: u64,
    pub balancer_stop_poll_seconds: u64,
    /// Default predicate boundary for the hybrid strategy (spec §4.7):
    /// below this many bytes, prefer dump over snapshot. Default 50 GiB.
    pub dump_max_data_size_bytes: u64,
    /// Advisory threshold (spec §4.3) past which a selected secondary's lag
    /// is logged as a warning but still used.
    pub too_stale_threshold_seconds: u64,
    /// `--forceTableScan` dump option toggle (spec §4.5).
    pub force_table_scan: bool,
    /// `noIndexRestore` restore option toggle (spec §4.8).
    pub no_index_restore: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_no_retries: MAX_NO_RETRIES,
            max_lock_time_seconds: MAX_LOCK_TIME_SECONDS,
            max_balancer_stop_wait_seconds: MAX_BALANCER_STOP_WAIT_SECONDS,
            balancer_resume_poll_seconds: BALANCER_RESUME_POLL_SECONDS,
            snapshot_pending_poll_seconds: SNAPSHOT_PENDING_POLL_SECONDS,
            snapshot_terminal_poll_seconds: SNAPSHOT_TERMINAL_POLL_SECONDS,
            balancer_stop_poll_seconds: BALANCER_STOP_POLL_SECONDS,
            dump_max_data_size_bytes: 50 * 1024 * 1024 * 1024,
            too_stale_threshold_seconds: 300,
            force_table_scan: false,
            no_index_restore: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_no_retries, 3);
        assert_eq!(cfg.max_lock_time_seconds, 60);
        assert_eq!(cfg.max_balancer_stop_wait_seconds, 1800);
        assert_eq!(cfg.dump_max_data_size_bytes, 50 * 1024 * 1024 * 1024);
    }
}
