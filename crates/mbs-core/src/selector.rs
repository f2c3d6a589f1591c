//! Member selection (C4): given a replica set's (or shard's) member list and
//! a preference, pick the concrete connector to back up from.
//!
//! Kept as pure functions over already-fetched member lists so the
//! preference/freshness/fallback rules (spec §4.3) are unit-testable without
//! a fake network round trip; the async shell that fetches the member list
//! and then validates liveness lives in [`crate::strategy`].

use mbs_errors::MbsError;

use crate::connector::ReplicaSetMember;
use crate::task::MemberPreference;
use crate::Result;

pub const USING_TOO_STALE_WARNING: &str = "USING_TOO_STALE_WARNING";
pub const USING_PRIMARY_WARNING: &str = "USING_PRIMARY_WARNING";

#[derive(Debug, Clone)]
pub struct SelectionWarning {
    pub event_name: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SelectionResult {
    pub address: String,
    pub is_primary: bool,
    pub warnings: Vec<SelectionWarning>,
}

fn no_eligible_members(uri: &str) -> MbsError {
    MbsError::NoEligibleMembersFound {
        uri: uri.to_string(),
    }
}

fn validate_priority_zero_rule(
    secondary: &ReplicaSetMember,
    has_priority_zero: bool,
    max_lag_seconds: u64,
    uri: &str,
) -> Result<()> {
    if max_lag_seconds > 0 && has_priority_zero && secondary.priority != 0.0 {
        return Err(no_eligible_members(uri));
    }
    Ok(())
}

fn too_stale_warning(
    secondary: &ReplicaSetMember,
    too_stale_threshold_seconds: u64,
) -> Vec<SelectionWarning> {
    if secondary.lag_seconds > too_stale_threshold_seconds {
        vec![SelectionWarning {
            event_name: USING_TOO_STALE_WARNING,
            message: format!(
                "Using secondary '{}' with lag {}s, which exceeds the advisory \
                 staleness threshold of {}s",
                secondary.address, secondary.lag_seconds, too_stale_threshold_seconds
            ),
        }]
    } else {
        Vec::new()
    }
}

fn best_secondary<'a>(
    members: &'a [ReplicaSetMember],
    max_lag_seconds: u64,
) -> Option<&'a ReplicaSetMember> {
    let candidates = members.iter().filter(|m| m.is_secondary && !m.is_primary);
    if max_lag_seconds > 0 {
        candidates
            .filter(|m| m.lag_seconds <= max_lag_seconds)
            .min_by_key(|m| m.lag_seconds)
    } else {
        candidates.min_by_key(|m| m.lag_seconds)
    }
}

fn primary_of<'a>(members: &'a [ReplicaSetMember]) -> Option<&'a ReplicaSetMember> {
    members.iter().find(|m| m.is_primary)
}

/// Pure implementation of the selection algorithm in spec §4.3 step 3, over
/// an already-fetched member list.
pub fn select_replica_set_member(
    members: &[ReplicaSetMember],
    preference: MemberPreference,
    max_lag_seconds: u64,
    too_stale_threshold_seconds: u64,
    uri: &str,
) -> Result<SelectionResult> {
    let has_priority_zero = members.iter().any(|m| m.priority == 0.0);

    match preference {
        MemberPreference::PrimaryOnly => {
            let primary = primary_of(members).ok_or_else(|| no_eligible_members(uri))?;
            Ok(SelectionResult {
                address: primary.address.clone(),
                is_primary: true,
                warnings: Vec::new(),
            })
        }
        MemberPreference::SecondaryOnly => {
            let secondary =
                best_secondary(members, max_lag_seconds).ok_or_else(|| no_eligible_members(uri))?;
            validate_priority_zero_rule(secondary, has_priority_zero, max_lag_seconds, uri)?;
            Ok(SelectionResult {
                address: secondary.address.clone(),
                is_primary: false,
                warnings: too_stale_warning(secondary, too_stale_threshold_seconds),
            })
        }
        // NOT_PRIMARY has no selection rule of its own: it only appears as a
        // validation constraint on an already-resumed member (a fresh
        // selection must fail here and fall through to "no eligible
        // member found", never opportunistically pick a secondary).
        MemberPreference::NotPrimary => Err(no_eligible_members(uri)),
        MemberPreference::Best => {
            if let Some(secondary) = best_secondary(members, max_lag_seconds) {
                validate_priority_zero_rule(secondary, has_priority_zero, max_lag_seconds, uri)?;
                Ok(SelectionResult {
                    address: secondary.address.clone(),
                    is_primary: false,
                    warnings: too_stale_warning(secondary, too_stale_threshold_seconds),
                })
            } else {
                let primary = primary_of(members).ok_or_else(|| no_eligible_members(uri))?;
                Ok(SelectionResult {
                    address: primary.address.clone(),
                    is_primary: true,
                    warnings: vec![SelectionWarning {
                        event_name: USING_PRIMARY_WARNING,
                        message: format!(
                            "No eligible secondary found; falling back to primary '{}'",
                            primary.address
                        ),
                    }],
                })
            }
        }
    }
}

/// Per-shard selection for a sharded source: hard-coded 5s max lag (spec
/// §4.3), one result per shard.
pub fn select_sharded_members(
    shards: &[Vec<ReplicaSetMember>],
    uri: &str,
) -> Result<Vec<SelectionResult>> {
    const SHARDED_MAX_LAG_SECONDS: u64 = 5;
    shards
        .iter()
        .map(|members| {
            select_replica_set_member(
                members,
                MemberPreference::Best,
                SHARDED_MAX_LAG_SECONDS,
                u64::MAX,
                uri,
            )
        })
        .collect()
}

/// Decides what to do when the selected connector turns out to be offline
/// (spec §4.3 "Validation step"). Returns whether the backup mode should
/// flip to offline, or an error if offline backups aren't allowed.
pub fn resolve_offline_selection(
    allow_offline_backups: bool,
    currently_online_mode: bool,
    uri: &str,
) -> Result<bool> {
    if allow_offline_backups {
        Ok(true)
    } else if currently_online_mode {
        Err(no_eligible_members(uri))
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(address: &str, is_primary: bool, is_secondary: bool, priority: f64, lag: u64) -> ReplicaSetMember {
        ReplicaSetMember {
            address: address.to_string(),
            is_primary,
            is_secondary,
            priority,
            lag_seconds: lag,
        }
    }

    #[test]
    fn scenario_1_picks_priority_zero_secondary_within_lag() {
        let members = vec![
            member("p:27017", true, false, 1.0, 0),
            member("s1:27017", false, true, 1.0, 2),
            member("s2:27017", false, true, 0.0, 3),
        ];
        let result =
            select_replica_set_member(&members, MemberPreference::Best, 10, 300, "uri").unwrap();
        assert_eq!(result.address, "s2:27017");
        assert!(!result.is_primary);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn fails_when_best_secondary_is_not_priority_zero_but_priority_zero_exists() {
        let members = vec![
            member("p:27017", true, false, 1.0, 0),
            member("s1:27017", false, true, 1.0, 2),
            member("s2:27017", false, true, 0.0, 30),
        ];
        // s1 is closer (lag 2 < 30) but not priority 0, and a priority-0
        // member exists in the set: must fail per spec §4.3.
        let result = select_replica_set_member(&members, MemberPreference::Best, 10, 300, "uri");
        assert!(result.is_err());
    }

    #[test]
    fn falls_back_to_primary_with_warning_when_no_secondary() {
        let members = vec![member("p:27017", true, false, 1.0, 0)];
        let result =
            select_replica_set_member(&members, MemberPreference::Best, 10, 300, "uri").unwrap();
        assert!(result.is_primary);
        assert_eq!(result.warnings[0].event_name, USING_PRIMARY_WARNING);
    }

    #[test]
    fn secondary_only_never_falls_back_to_primary() {
        let members = vec![member("p:27017", true, false, 1.0, 0)];
        let result = select_replica_set_member(&members, MemberPreference::SecondaryOnly, 10, 300, "uri");
        assert!(result.is_err());
    }

    #[test]
    fn not_primary_never_succeeds_on_fresh_selection() {
        let members = vec![
            member("p:27017", true, false, 1.0, 0),
            member("s1:27017", false, true, 1.0, 2),
        ];
        let result = select_replica_set_member(&members, MemberPreference::NotPrimary, 10, 300, "uri");
        assert!(result.is_err());
    }

    #[test]
    fn too_stale_logs_warning_but_still_selects() {
        let members = vec![
            member("p:27017", true, false, 1.0, 0),
            member("s1:27017", false, true, 1.0, 400),
        ];
        let result =
            select_replica_set_member(&members, MemberPreference::Best, 0, 300, "uri").unwrap();
        assert_eq!(result.address, "s1:27017");
        assert_eq!(result.warnings[0].event_name, USING_TOO_STALE_WARNING);
    }

    #[test]
    fn offline_resolution_allows_or_fails() {
        assert_eq!(resolve_offline_selection(true, true, "uri").unwrap(), true);
        assert!(resolve_offline_selection(false, true, "uri").is_err());
        assert_eq!(
            resolve_offline_selection(false, false, "uri").unwrap(),
            false
        );
    }
}
