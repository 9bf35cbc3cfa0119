//! Member selection.
//!
//! Pure functions over a [`ClusterSnapshot`]: given a target scope and a
//! demand, pick the member a resource should land on. The caller applies the
//! decision in the same commit it was computed from.

use drover_events::{MemberStatus, SchedulerMode};
use drover_id::MemberId;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::store::{ClusterSnapshot, Member, Resources, TargetScope};

/// How unconstrained placements pick their candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// Every online member in scheduler mode `all`.
    #[default]
    All,
    /// Like `All`, restricted to the project's default group.
    Group,
}

/// Weights applied to each dimension of a member's load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub cpu: f64,
    pub memory: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 1.0,
        }
    }
}

/// One placement decision to make.
#[derive(Debug, Clone, Copy)]
pub struct PlacementQuery<'a> {
    pub scope: &'a TargetScope,
    pub project: &'a str,
    pub demand: Resources,
    pub policy: PlacementPolicy,
    pub weights: ScoreWeights,
    /// Member that must not be chosen, usually the current host.
    pub exclude: Option<&'a MemberId>,
    /// Accept an explicitly named member that is restoring.
    pub allow_restoring: bool,
}

fn ratio(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        return if used == 0 { 0.0 } else { 1.0 };
    }
    used as f64 / capacity as f64
}

/// Resource-weighted load of `member`. Lower is better.
pub fn load_score(member: &Member, weights: &ScoreWeights) -> f64 {
    weights.cpu * ratio(member.load.cpu_millis, member.capacity.cpu_millis)
        + weights.memory * ratio(member.load.memory_bytes, member.capacity.memory_bytes)
}

/// Picks the member for `query`.
///
/// An explicitly named member is never substituted: if it cannot take the
/// resource the call fails with `TargetUnavailable`.
pub fn select_member<'a>(
    snapshot: &'a ClusterSnapshot,
    query: &PlacementQuery<'_>,
) -> ClusterResult<&'a Member> {
    match query.scope {
        TargetScope::Member(name) => explicit_member(snapshot, name, query),
        TargetScope::Group(group) => {
            if !snapshot.groups.contains_key(group) {
                return Err(ClusterError::UnknownGroup(group.clone()));
            }
            let candidates: Vec<&Member> = snapshot
                .members
                .values()
                .filter(|m| m.status.accepts_placements())
                .filter(|m| m.scheduler_mode != SchedulerMode::Manual)
                .filter(|m| m.in_group(group))
                .filter(|m| Some(&m.id) != query.exclude)
                .collect();
            if candidates.is_empty() {
                return Err(ClusterError::NoEligibleMembers(format!(
                    "no online members in group {group}"
                )));
            }
            pick_least_loaded(candidates, query)
        }
        TargetScope::Any => {
            let project_group = snapshot.project_group(query.project);
            let candidates: Vec<&Member> = snapshot
                .members
                .values()
                .filter(|m| m.status.accepts_placements())
                .filter(|m| m.scheduler_mode == SchedulerMode::All)
                .filter(|m| query.policy != PlacementPolicy::Group || m.in_group(project_group))
                .filter(|m| Some(&m.id) != query.exclude)
                .collect();
            if candidates.is_empty() {
                return Err(ClusterError::NoEligibleMembers(
                    "no online members accept automatic placement".to_string(),
                ));
            }
            pick_least_loaded(candidates, query)
        }
    }
}

fn explicit_member<'a>(
    snapshot: &'a ClusterSnapshot,
    name: &str,
    query: &PlacementQuery<'_>,
) -> ClusterResult<&'a Member> {
    let member = snapshot
        .member_by_name(name)
        .ok_or_else(|| ClusterError::MemberNotFound(name.to_string()))?;

    if Some(&member.id) == query.exclude {
        return Err(ClusterError::TargetUnavailable(format!(
            "{name} already hosts the resource"
        )));
    }

    let usable = member.status == MemberStatus::Online
        || (query.allow_restoring && member.status == MemberStatus::Restoring);
    if !usable {
        return Err(ClusterError::TargetUnavailable(format!(
            "{name} is {}",
            member.status
        )));
    }

    if !member.has_room_for(&query.demand) {
        return Err(ClusterError::TargetUnavailable(format!(
            "{name} lacks capacity for the request"
        )));
    }

    Ok(member)
}

fn pick_least_loaded<'a>(
    candidates: Vec<&'a Member>,
    query: &PlacementQuery<'_>,
) -> ClusterResult<&'a Member> {
    candidates
        .into_iter()
        .filter(|m| m.has_room_for(&query.demand))
        .map(|m| (load_score(m, &query.weights), m))
        .min_by(|(a, ma), (b, mb)| a.total_cmp(b).then_with(|| ma.name.cmp(&mb.name)))
        .map(|(_, m)| m)
        .ok_or_else(|| {
            ClusterError::NoEligibleMembers(format!(
                "no candidate in {} has capacity for the request",
                query.scope
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Group, Project};
    use chrono::Utc;
    use drover_events::MemberRole;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::collections::BTreeSet;

    fn member(name: &str, load: (u64, u64), groups: &[&str]) -> Member {
        Member {
            id: MemberId::new(),
            name: name.to_string(),
            address: format!("{name}.cluster:8443"),
            role: MemberRole::Voter,
            status: MemberStatus::Online,
            groups: groups.iter().map(|g| g.to_string()).collect::<BTreeSet<_>>(),
            scheduler_mode: SchedulerMode::All,
            capacity: Resources::new(4000, 8_000),
            load: Resources::new(load.0, load.1),
            resource_count: 0,
            fingerprint: None,
            last_heartbeat: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn snapshot(members: Vec<Member>) -> ClusterSnapshot {
        let mut snapshot = ClusterSnapshot::seeded();
        snapshot.groups.insert(
            "gpu".to_string(),
            Group {
                name: "gpu".to_string(),
                description: String::new(),
            },
        );
        for m in members {
            snapshot.members.insert(m.id, m);
        }
        snapshot
    }

    fn query<'a>(scope: &'a TargetScope, demand: Resources) -> PlacementQuery<'a> {
        PlacementQuery {
            scope,
            project: "default",
            demand,
            policy: PlacementPolicy::All,
            weights: ScoreWeights::default(),
            exclude: None,
            allow_restoring: false,
        }
    }

    #[test]
    fn test_unconstrained_picks_least_loaded() {
        let s = snapshot(vec![
            member("m1", (2000, 4000), &["default"]),
            member("m2", (500, 1000), &["default"]),
            member("m3", (3000, 100), &["default"]),
        ]);
        let scope = TargetScope::Any;
        let chosen = select_member(&s, &query(&scope, Resources::new(100, 100))).unwrap();
        assert_eq!(chosen.name, "m2");
    }

    #[test]
    fn test_ties_break_on_name() {
        let s = snapshot(vec![
            member("m2", (0, 0), &["default"]),
            member("m1", (0, 0), &["default"]),
        ]);
        let scope = TargetScope::Any;
        let chosen = select_member(&s, &query(&scope, Resources::ZERO)).unwrap();
        assert_eq!(chosen.name, "m1");
    }

    #[test]
    fn test_members_without_capacity_are_skipped() {
        let s = snapshot(vec![
            member("m1", (3900, 0), &["default"]),
            member("m2", (3000, 7000), &["default"]),
        ]);
        let scope = TargetScope::Any;
        let chosen = select_member(&s, &query(&scope, Resources::new(500, 500))).unwrap();
        assert_eq!(chosen.name, "m2");

        let err = select_member(&s, &query(&scope, Resources::new(2000, 0))).unwrap_err();
        assert!(matches!(err, ClusterError::NoEligibleMembers(_)));
    }

    #[rstest]
    #[case(MemberStatus::Offline)]
    #[case(MemberStatus::Evacuating)]
    #[case(MemberStatus::Evacuated)]
    #[case(MemberStatus::Restoring)]
    #[case(MemberStatus::Joining)]
    fn test_explicit_member_must_be_online(#[case] status: MemberStatus) {
        let mut m = member("m1", (0, 0), &["default"]);
        m.status = status;
        let s = snapshot(vec![m, member("m2", (0, 0), &["default"])]);
        let scope = TargetScope::Member("m1".into());

        let err = select_member(&s, &query(&scope, Resources::ZERO)).unwrap_err();
        assert!(matches!(err, ClusterError::TargetUnavailable(_)));
    }

    #[test]
    fn test_explicit_restoring_member_allowed_when_requested() {
        let mut m = member("m1", (0, 0), &["default"]);
        m.status = MemberStatus::Restoring;
        let s = snapshot(vec![m]);
        let scope = TargetScope::Member("m1".into());
        let mut q = query(&scope, Resources::ZERO);
        q.allow_restoring = true;
        assert_eq!(select_member(&s, &q).unwrap().name, "m1");
    }

    #[test]
    fn test_explicit_member_without_capacity() {
        let s = snapshot(vec![member("m1", (4000, 0), &["default"])]);
        let scope = TargetScope::Member("m1".into());
        let err = select_member(&s, &query(&scope, Resources::new(1, 0))).unwrap_err();
        assert!(matches!(err, ClusterError::TargetUnavailable(_)));
    }

    #[test]
    fn test_explicit_unknown_member() {
        let s = snapshot(vec![]);
        let scope = TargetScope::Member("m9".into());
        let err = select_member(&s, &query(&scope, Resources::ZERO)).unwrap_err();
        assert!(matches!(err, ClusterError::MemberNotFound(_)));
    }

    #[test]
    fn test_group_scope() {
        let mut manual = member("m3", (0, 0), &["default", "gpu"]);
        manual.scheduler_mode = SchedulerMode::Manual;
        let mut grouped = member("m2", (1000, 0), &["default", "gpu"]);
        grouped.scheduler_mode = SchedulerMode::Group;
        let s = snapshot(vec![member("m1", (0, 0), &["default"]), grouped, manual]);

        let scope = TargetScope::Group("gpu".into());
        assert_eq!(select_member(&s, &query(&scope, Resources::ZERO)).unwrap().name, "m2");

        let unknown = TargetScope::Group("tpu".into());
        assert!(matches!(
            select_member(&s, &query(&unknown, Resources::ZERO)),
            Err(ClusterError::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_group_scope_with_no_online_members() {
        let mut m = member("m1", (0, 0), &["gpu"]);
        m.status = MemberStatus::Offline;
        let s = snapshot(vec![m]);
        let scope = TargetScope::Group("gpu".into());
        assert!(matches!(
            select_member(&s, &query(&scope, Resources::ZERO)),
            Err(ClusterError::NoEligibleMembers(_))
        ));
    }

    #[test]
    fn test_unconstrained_skips_non_all_modes() {
        let mut m1 = member("m1", (0, 0), &["default"]);
        m1.scheduler_mode = SchedulerMode::Group;
        let mut m2 = member("m2", (0, 0), &["default"]);
        m2.scheduler_mode = SchedulerMode::Manual;
        let s = snapshot(vec![m1, m2]);
        let scope = TargetScope::Any;
        assert!(matches!(
            select_member(&s, &query(&scope, Resources::ZERO)),
            Err(ClusterError::NoEligibleMembers(_))
        ));
    }

    #[test]
    fn test_group_policy_uses_project_default_group() {
        let mut s = snapshot(vec![
            member("m1", (0, 0), &["default"]),
            member("m2", (2000, 0), &["default", "gpu"]),
        ]);
        s.projects.insert(
            "ml".to_string(),
            Project {
                name: "ml".to_string(),
                default_group: "gpu".to_string(),
            },
        );

        let scope = TargetScope::Any;
        let mut q = query(&scope, Resources::ZERO);
        q.project = "ml";
        assert_eq!(select_member(&s, &q).unwrap().name, "m1");

        q.policy = PlacementPolicy::Group;
        assert_eq!(select_member(&s, &q).unwrap().name, "m2");
    }

    #[test]
    fn test_exclude_current_host() {
        let m1 = member("m1", (0, 0), &["default"]);
        let m1_id = m1.id;
        let s = snapshot(vec![m1, member("m2", (3000, 0), &["default"])]);
        let scope = TargetScope::Any;
        let mut q = query(&scope, Resources::ZERO);
        q.exclude = Some(&m1_id);
        assert_eq!(select_member(&s, &q).unwrap().name, "m2");
    }

    #[test]
    fn test_zero_capacity_ratio() {
        let mut m = member("m1", (0, 0), &[]);
        m.capacity = Resources::ZERO;
        assert_eq!(load_score(&m, &ScoreWeights::default()), 0.0);
        m.load = Resources::new(1, 0);
        assert_eq!(load_score(&m, &ScoreWeights::default()), 1.0);
    }

    proptest! {
        #[test]
        fn prop_choice_has_room_and_minimal_score(
            loads in proptest::collection::vec((0u64..4000, 0u64..8000), 1..8),
            demand_cpu in 0u64..2000,
        ) {
            let members: Vec<Member> = loads
                .iter()
                .enumerate()
                .map(|(i, l)| member(&format!("m{i}"), *l, &["default"]))
                .collect();
            let s = snapshot(members);
            let scope = TargetScope::Any;
            let demand = Resources::new(demand_cpu, 0);

            match select_member(&s, &query(&scope, demand)) {
                Ok(chosen) => {
                    prop_assert!(chosen.has_room_for(&demand));
                    let best = load_score(chosen, &ScoreWeights::default());
                    for m in s.members.values().filter(|m| m.has_room_for(&demand)) {
                        prop_assert!(best <= load_score(m, &ScoreWeights::default()));
                    }
                }
                Err(_) => {
                    prop_assert!(s.members.values().all(|m| !m.has_room_for(&demand)));
                }
            }
        }
    }
}
