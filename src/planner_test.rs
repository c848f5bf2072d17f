use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use proptest::prelude::*;

use crate::fixtures;
use crate::models::{ControllerMachine, HostPort, Life, MachineId, MemberHealth, MemberId, SpaceName, VoteIntent};
use crate::planner::{self, is_quorum_safe, Condition, Plan, PlanConfig, PlanInput};
use crate::topology::{Action, Topology};

fn run_plan(current: &Topology, status: &HashMap<MemberId, MemberHealth>, machines: &[ControllerMachine], config: &PlanConfig) -> Plan {
    planner::plan(&PlanInput {
        current,
        status,
        machines,
        config,
    })
}

fn ids(ids: &[u64]) -> BTreeSet<MemberId> {
    ids.iter().copied().map(MemberId).collect()
}

#[test]
fn plan_is_noop_when_converged() {
    let current = fixtures::topology(vec![fixtures::member(1, 1, true), fixtures::member(2, 2, true), fixtures::member(3, 3, true)]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::ready())]);
    let machines = vec![fixtures::machine(1), fixtures::machine(2), fixtures::machine(3)];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert!(plan.is_noop(), "expected converged peer group to produce no actions, got {:?}", plan.actions);
    assert!(plan.conditions.is_empty(), "expected no conditions, got {:?}", plan.conditions);
    assert_eq!(plan.next, current);
}

#[test]
fn plan_adds_new_controllers_without_votes() {
    let current = fixtures::topology(vec![fixtures::member(1, 1, true)]);
    let status = fixtures::statuses(vec![(1, fixtures::primary())]);
    let machines = vec![fixtures::machine(1), fixtures::machine(2), fixtures::machine(3)];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert_eq!(plan.actions, vec![Action::AddMember(fixtures::member(2, 2, false)), Action::AddMember(fixtures::member(3, 3, false))]);
    assert_eq!(plan.next.voters(), ids(&[1]), "expected new members to join without votes");
    assert!(
        plan.conditions.contains(&Condition::InsufficientControllers { healthy: 1, desired: 3 }),
        "expected insufficient controllers condition, got {:?}",
        plan.conditions
    );
}

#[test]
fn plan_grants_votes_to_caught_up_members() {
    let current = fixtures::topology(vec![fixtures::member(1, 1, true), fixtures::member(2, 2, false), fixtures::member(3, 3, false)]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::ready())]);
    let machines = vec![fixtures::machine(1), fixtures::machine(2), fixtures::machine(3)];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert_eq!(
        plan.actions,
        vec![
            Action::GrantVote {
                member: MemberId(2),
                machine: MachineId::new("2")
            },
            Action::GrantVote {
                member: MemberId(3),
                machine: MachineId::new("3")
            },
        ]
    );
    assert_eq!(plan.next.voters(), ids(&[1, 2, 3]));
}

#[test]
fn plan_holds_back_candidate_to_keep_voters_odd() {
    let current = fixtures::topology(vec![fixtures::member(1, 1, true), fixtures::member(2, 2, false), fixtures::member(3, 3, false)]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::startup())]);
    let machines = vec![fixtures::machine(1), fixtures::machine(2), fixtures::machine(3)];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert!(plan.is_noop(), "expected no vote to be granted while it would leave two voters, got {:?}", plan.actions);
    assert_eq!(plan.next.voters(), ids(&[1]));
}

#[test]
fn plan_keeps_unhealthy_voters() {
    let current = fixtures::topology(vec![fixtures::member(1, 1, true), fixtures::member(2, 2, true), fixtures::member(3, 3, true)]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::down())]);
    let machines = vec![fixtures::machine(1), fixtures::machine(2), fixtures::machine(3)];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert!(plan.is_noop(), "expected unhealthy voter to keep its vote, got {:?}", plan.actions);
    assert_eq!(plan.next.voters(), ids(&[1, 2, 3]));
    assert!(
        plan.conditions.contains(&Condition::InsufficientControllers { healthy: 2, desired: 3 }),
        "expected insufficient controllers condition, got {:?}",
        plan.conditions
    );
}

#[test]
fn plan_demotes_voter_leaving_two_controllers() {
    let current = fixtures::topology(vec![fixtures::member(1, 1, true), fixtures::member(2, 2, true), fixtures::member(3, 3, true)]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::ready())]);
    let mut demoted = fixtures::machine(3);
    demoted.intent = Some(VoteIntent::Demote);
    let machines = vec![fixtures::machine(1), fixtures::machine(2), demoted];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert_eq!(
        plan.actions,
        vec![
            Action::RevokeVote {
                member: MemberId(3),
                machine: Some(MachineId::new("3")),
            },
            Action::RemoveMember {
                member: MemberId(3),
                machine: Some(MachineId::new("3")),
            },
        ],
        "expected demoted voter to lose its vote and then be removed"
    );
    assert_eq!(plan.next.voters(), ids(&[1, 2]));
    assert!(
        !plan.conditions.iter().any(|c| matches!(c, Condition::StaleVoterRetained { .. })),
        "expected no stale voter to be retained, got {:?}",
        plan.conditions
    );

    // Two voters is a fixed point.
    let again = run_plan(&plan.next, &status, &machines, &fixtures::plan_config());
    assert!(again.is_noop(), "expected two remaining voters to be stable, got {:?}", again.actions);
}

#[test]
fn plan_retains_stale_voter_while_revocation_is_unsafe() {
    let current = fixtures::topology(vec![fixtures::member(1, 1, true), fixtures::member(2, 2, true), fixtures::member(3, 3, true)]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::down()), (3, fixtures::ready())]);
    let mut demoted = fixtures::machine(3);
    demoted.intent = Some(VoteIntent::Demote);
    let machines = vec![fixtures::machine(1), fixtures::machine(2), demoted];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert!(plan.is_noop(), "expected demotion to wait while member 2 is down, got {:?}", plan.actions);
    assert!(
        plan.conditions.contains(&Condition::StaleVoterRetained {
            member: MemberId(3),
            machine: Some(MachineId::new("3")),
        }),
        "expected stale voter condition, got {:?}",
        plan.conditions
    );
}

#[test]
fn plan_steps_down_stale_voters_through_odd_sizes() {
    let current = fixtures::topology(vec![
        fixtures::member(1, 1, true),
        fixtures::member(2, 2, true),
        fixtures::member(3, 3, true),
        fixtures::member(4, 4, false),
        fixtures::member(5, 5, false),
        fixtures::member(6, 6, false),
    ]);
    let status = fixtures::statuses((1..=6).map(|id| (id, fixtures::ready())).collect());
    let mut machines: Vec<ControllerMachine> = (1..=6).map(fixtures::machine).collect();
    for machine in machines.iter_mut().take(3) {
        machine.desired_vote = false;
    }

    // Revoking all three old voters at once would pass through a single voter.
    let first = run_plan(&current, &status, &machines, &fixtures::plan_config());
    assert_eq!(first.next.voters(), ids(&[1, 2, 4, 5, 6]), "expected two stale voters to be retained, got {:?}", first.actions);
    assert!(first.next.member(MemberId(3)).is_none(), "expected the released stale voter to be removed");
    for id in [1, 2] {
        assert!(
            first.conditions.contains(&Condition::StaleVoterRetained {
                member: MemberId(id),
                machine: Some(MachineId::new(id.to_string())),
            }),
            "expected member {} to be retained, got {:?}",
            id,
            first.conditions
        );
    }

    let second = run_plan(&first.next, &status, &machines, &fixtures::plan_config());
    assert_eq!(second.next.voters(), ids(&[4, 5, 6]));
    assert_eq!(second.next.len(), 3, "expected old members to be removed, got {:?}", second.next);
    assert!(run_plan(&second.next, &status, &machines, &fixtures::plan_config()).is_noop());
}

#[test]
fn plan_grants_candidates_before_revoking_last_stale_voter() {
    let current = fixtures::topology(vec![
        fixtures::member(1, 1, true),
        fixtures::member(2, 2, false),
        fixtures::member(3, 3, false),
        fixtures::member(4, 4, false),
    ]);
    let status = fixtures::statuses((1..=4).map(|id| (id, fixtures::ready())).collect());
    let mut machines: Vec<ControllerMachine> = (1..=4).map(fixtures::machine).collect();
    machines[0].desired_vote = false;

    let first = run_plan(&current, &status, &machines, &fixtures::plan_config());
    assert_eq!(first.next.voters(), ids(&[1, 2, 3]), "expected candidates to be granted first, got {:?}", first.actions);
    assert!(first.actions.iter().all(|a| a.vote_change() != Some(false)), "expected no revocation, got {:?}", first.actions);

    let second = run_plan(&first.next, &status, &machines, &fixtures::plan_config());
    assert_eq!(second.next.voters(), ids(&[2, 3, 4]));
    assert!(second.next.member(MemberId(1)).is_none(), "expected the stale member to be removed");
}

#[test]
fn plan_swaps_stale_voter_for_replacement() {
    let current = fixtures::topology(vec![
        fixtures::member(1, 1, true),
        fixtures::member(2, 2, true),
        fixtures::member(3, 3, true),
        fixtures::member(4, 4, false),
    ]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::ready()), (4, fixtures::ready())]);
    let mut demoted = fixtures::machine(3);
    demoted.desired_vote = false;
    let machines = vec![fixtures::machine(1), fixtures::machine(2), demoted, fixtures::machine(4)];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert_eq!(
        plan.actions,
        vec![
            Action::RevokeVote {
                member: MemberId(3),
                machine: Some(MachineId::new("3")),
            },
            Action::GrantVote {
                member: MemberId(4),
                machine: MachineId::new("4"),
            },
            Action::RemoveMember {
                member: MemberId(3),
                machine: Some(MachineId::new("3")),
            },
        ],
        "expected revocation, then grant, then removal"
    );
    assert_eq!(plan.next.voters(), ids(&[1, 2, 4]));
    assert!(plan.next.member(MemberId(3)).is_none(), "expected demoted member to be removed");
}

#[test]
fn plan_removes_members_of_dead_machines() {
    let current = fixtures::topology(vec![
        fixtures::member(1, 1, true),
        fixtures::member(2, 2, true),
        fixtures::member(3, 3, true),
        fixtures::member(4, 4, false),
    ]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::ready()), (4, fixtures::down())]);
    let mut dead = fixtures::machine(4);
    dead.life = Life::Dead;
    let machines = vec![fixtures::machine(1), fixtures::machine(2), fixtures::machine(3), dead];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert_eq!(
        plan.actions,
        vec![Action::RemoveMember {
            member: MemberId(4),
            machine: Some(MachineId::new("4")),
        }]
    );
}

#[test]
fn plan_excludes_machines_without_address_in_ha_space() {
    let current = fixtures::topology(vec![fixtures::member(1, 1, true), fixtures::member(2, 2, true), fixtures::member(3, 3, true)]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::ready())]);
    let mut spaceless = fixtures::machine(3);
    spaceless.addresses[0].space = None;
    let machines = vec![fixtures::machine(1), fixtures::machine(2), spaceless];
    let config = PlanConfig {
        ha_space: Some(SpaceName::new("mgmt")),
        ..fixtures::plan_config()
    };

    let plan = run_plan(&current, &status, &machines, &config);

    assert!(plan.is_noop(), "expected excluded machine's member to be left untouched, got {:?}", plan.actions);
    assert_eq!(plan.next.voters(), ids(&[1, 2, 3]));
    assert!(
        plan.conditions
            .iter()
            .any(|c| matches!(c, Condition::MachineExcluded { machine, .. } if machine == &MachineId::new("3"))),
        "expected machine 3 to be excluded, got {:?}",
        plan.conditions
    );
}

#[test]
fn plan_updates_changed_addresses() {
    let current = fixtures::topology(vec![fixtures::member(1, 1, true), fixtures::member(2, 2, true), fixtures::member(3, 3, true)]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::ready())]);
    let mut moved = fixtures::machine(2);
    moved.addresses[0].value = "10.0.1.2".into();
    let machines = vec![fixtures::machine(1), moved, fixtures::machine(3)];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert_eq!(
        plan.actions,
        vec![Action::UpdateAddress {
            member: MemberId(2),
            machine: MachineId::new("2"),
            address: HostPort {
                host: "10.0.1.2".into(),
                port: fixtures::PEER_PORT,
            },
        }]
    );
}

#[test]
fn plan_never_revokes_below_quorum() {
    // Two of three voters are down; demoting the healthy one would lose quorum.
    let current = fixtures::topology(vec![fixtures::member(1, 1, true), fixtures::member(2, 2, true), fixtures::member(3, 3, true)]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::down()), (3, fixtures::down())]);
    let mut demoted = fixtures::machine(1);
    demoted.desired_vote = false;
    let machines = vec![demoted, fixtures::machine(2), fixtures::machine(3)];

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert!(plan.actions.iter().all(|a| a.vote_change().is_none()), "expected no vote changes, got {:?}", plan.actions);
    assert_eq!(plan.next.voters(), ids(&[1, 2, 3]));
}

#[test]
fn plan_keeps_even_voters_when_no_safe_change_exists() {
    let current = fixtures::topology(vec![
        fixtures::member(1, 1, true),
        fixtures::member(2, 2, true),
        fixtures::member(3, 3, true),
        fixtures::member(4, 4, true),
    ]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::down()), (4, fixtures::down())]);
    let machines: Vec<ControllerMachine> = (1..=4).map(fixtures::machine).collect();

    let plan = run_plan(&current, &status, &machines, &fixtures::plan_config());

    assert!(plan.is_noop(), "expected no changes while every revocation is unsafe, got {:?}", plan.actions);
    assert_eq!(plan.next.voters(), ids(&[1, 2, 3, 4]), "expected the even voting set to be kept");
    assert!(
        plan.conditions.contains(&Condition::UnsafeTransitionDeferred),
        "expected deferred transition condition, got {:?}",
        plan.conditions
    );
}

#[test]
fn plan_never_reuses_id_of_removed_member() -> Result<()> {
    let current = fixtures::topology(vec![
        fixtures::member(1, 1, true),
        fixtures::member(2, 2, true),
        fixtures::member(3, 3, true),
        fixtures::member(4, 4, false),
    ]);
    let status = fixtures::statuses(vec![(1, fixtures::primary()), (2, fixtures::ready()), (3, fixtures::ready()), (4, fixtures::down())]);
    let mut dead = fixtures::machine(4);
    dead.life = Life::Dead;
    let first = run_plan(&current, &status, &[fixtures::machine(1), fixtures::machine(2), fixtures::machine(3), dead], &fixtures::plan_config());
    assert!(first.next.member(MemberId(4)).is_none(), "expected member 4 to be removed");

    // The next cycle starts from what the store holds.
    let stored = Topology::from_config(&first.next.to_config(2))?;
    let machines = vec![fixtures::machine(1), fixtures::machine(2), fixtures::machine(3), fixtures::machine(5)];
    let second = run_plan(&stored, &status, &machines, &fixtures::plan_config());

    assert_eq!(second.actions, vec![Action::AddMember(fixtures::member(5, 5, false))], "expected a fresh member id for machine 5");
    Ok(())
}

#[test]
fn quorum_safety_checks_each_revocation() {
    let current = ids(&[1, 2, 3]);
    let status = fixtures::statuses(vec![(1, fixtures::ready()), (2, fixtures::ready()), (3, fixtures::ready())]);
    let revoke = |id: u64| Action::RevokeVote {
        member: MemberId(id),
        machine: Some(MachineId::new(id.to_string())),
    };

    assert!(is_quorum_safe(&current, &[revoke(3)], &status));
    assert!(!is_quorum_safe(&current, &[revoke(3), revoke(2)], &status), "expected dropping to a single voter to be unsafe");
}

//////////////////////////////////////////////////////////////////////////////
// Properties ////////////////////////////////////////////////////////////////

/// A generated member: whether it votes, whether its machine wants a vote, and its health.
type MemberSpec = (bool, bool, u8);

fn build_world(specs: &[MemberSpec], extra_machines: u64) -> (Topology, HashMap<MemberId, MemberHealth>, Vec<ControllerMachine>) {
    let mut members = vec![];
    let mut status = HashMap::new();
    let mut machines = vec![];
    for (idx, (voting, wanted, health)) in specs.iter().enumerate() {
        let id = idx as u64 + 1;
        // The oldest member always votes, as a store always has at least one voter.
        members.push(fixtures::member(id, id, *voting || id == 1));
        let health = match health {
            0 => fixtures::ready(),
            1 => fixtures::startup(),
            _ => fixtures::down(),
        };
        status.insert(MemberId(id), health);
        let mut machine = fixtures::machine(id);
        machine.desired_vote = *wanted;
        machines.push(machine);
    }
    let next = specs.len() as u64 + 1;
    machines.extend((next..next + extra_machines).map(fixtures::machine));
    (fixtures::topology(members), status, machines)
}

proptest! {
    #[test]
    fn plan_upholds_safety_properties(specs in prop::collection::vec((any::<bool>(), any::<bool>(), 0u8..3), 1..7), extra in 0u64..3) {
        let (current, status, machines) = build_world(&specs, extra);
        let config = fixtures::plan_config();
        prop_assume!(current.voting_count() % 2 == 1);
        let plan = run_plan(&current, &status, &machines, &config);

        prop_assert!(is_quorum_safe(&current.voters(), &plan.actions, &status), "unsafe plan {:?}", plan.actions);
        let voting = plan.next.voting_count();
        prop_assert!(voting % 2 == 1 || voting == 2, "even voting set planned: {:?}", plan.next.voters());
        for action in plan.actions.iter() {
            if let Action::AddMember(member) = action {
                prop_assert!(!member.is_voter(), "member added with a vote: {:?}", member);
            }
        }
        let ranks: Vec<u8> = plan.actions.iter().map(Action::rank).collect();
        prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "actions out of order: {:?}", plan.actions);

        let again = run_plan(&current, &status, &machines, &config);
        prop_assert_eq!(&plan.actions, &again.actions);
    }

    #[test]
    fn plan_converges(specs in prop::collection::vec((any::<bool>(), any::<bool>(), 0u8..3), 1..7), extra in 0u64..3) {
        let (mut current, status, machines) = build_world(&specs, extra);
        let config = fixtures::plan_config();
        let mut converged = false;
        for _ in 0..12 {
            let plan = run_plan(&current, &status, &machines, &config);
            if plan.is_noop() {
                converged = true;
                break;
            }
            current = plan.next;
        }
        prop_assert!(converged, "plan did not converge, last topology {:?}", current);
    }

    #[test]
    fn plan_converges_to_wanted_voters(specs in prop::collection::vec((any::<bool>(), any::<bool>()), 3..8), extra in 0u64..3) {
        // Every member, including those added along the way, is healthy & caught up.
        let total = specs.len() as u64 + extra;
        let status = fixtures::statuses((1..=total).map(|id| (id, fixtures::ready())).collect());
        let mut members = vec![];
        let mut machines = vec![];
        for (idx, (voting, wanted)) in specs.iter().enumerate() {
            let id = idx as u64 + 1;
            members.push(fixtures::member(id, id, *voting || id == 1));
            let mut machine = fixtures::machine(id);
            machine.desired_vote = *wanted;
            machines.push(machine);
        }
        machines.extend((specs.len() as u64 + 1..=total).map(fixtures::machine));
        let wanted: BTreeSet<MachineId> = machines.iter().filter(|m| m.desired_vote).map(|m| m.id.clone()).collect();
        prop_assume!(wanted.len() >= 3 && wanted.len() % 2 == 1);

        let mut current = fixtures::topology(members);
        let config = fixtures::plan_config();
        let mut converged = false;
        for _ in 0..12 {
            let plan = run_plan(&current, &status, &machines, &config);
            if plan.is_noop() {
                converged = true;
                break;
            }
            current = plan.next;
        }
        prop_assert!(converged, "plan did not converge, last topology {:?}", current);

        let voting: BTreeSet<MachineId> = current.members().filter(|m| m.is_voter()).filter_map(|m| m.machine_id()).collect();
        prop_assert_eq!(&voting, &wanted, "expected exactly the wanted machines to vote, got {:?}", current);
        prop_assert_eq!(current.len(), wanted.len(), "expected unwanted members to be removed, got {:?}", current);
    }
}
