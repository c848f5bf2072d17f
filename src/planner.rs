//! Peer group topology planner.
//!
//! The planner is a pure function from the observed state of the world (the store's current
//! topology & member health, plus the controller machines of the durable model) to a desired
//! topology and the ordered list of atomic actions which reach it.
//!
//! ## Voting Set
//! The natural voting set is every member whose machine wants a vote and which either votes
//! already, or is healthy and caught up. Unhealthy voters keep their vote: flapping health checks
//! must never cause self-inflicted quorum loss. When the natural set has an even size, one of the
//! following adjustments is made:
//!
//! - hold back the newest candidate (growing);
//! - retain an odd number of stale voters (shrinking);
//! - drop one unhealthy voter (its healthy peers already vote);
//! - drop the newest healthy voter;
//! - keep a natural set of exactly two voters as is.
//!
//! Stale voters may also be retained alongside an odd natural set, or alongside a natural set
//! with its newest candidate held back, so that candidates gain their vote before stale voters
//! lose theirs. Only adjustments whose action sequence is quorum safe are considered.
//! Adjustments which retain the fewest stale voters win, followed by the least churn against the
//! current voting set.
//!
//! ## Action Ordering
//! Actions are always ordered as revocations, grants, removals, address updates, additions. A
//! member is only ever removed once it no longer votes, and new members always join without a
//! vote.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::address::select_address;
use crate::models::{ControllerMachine, HostPort, MachineId, MemberHealth, MemberId, PeerGroupMember, SpaceName};
use crate::topology::{Action, Topology};

/// Planner configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct PlanConfig {
    /// The space from which peer addresses must be selected, if any.
    pub ha_space: Option<SpaceName>,
    /// The number of controllers the operator asked for.
    pub desired_controller_count: usize,
    /// The port used for peer traffic.
    pub peer_port: u16,
}

/// The observed state of the world, as input to the planner.
pub struct PlanInput<'a> {
    pub current: &'a Topology,
    pub status: &'a HashMap<MemberId, MemberHealth>,
    pub machines: &'a [ControllerMachine],
    pub config: &'a PlanConfig,
}

/// A non-fatal condition observed while planning.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// Fewer healthy controllers are available than were asked for.
    InsufficientControllers { healthy: usize, desired: usize },
    /// The machine was left out of this plan, e.g. because it has no usable address.
    MachineExcluded { machine: MachineId, reason: String },
    /// A voter which no longer wants a vote keeps it, as dropping it now would be unsafe or would
    /// leave an even number of voters.
    StaleVoterRetained { member: MemberId, machine: Option<MachineId> },
    /// No quorum safe change of the voting set was available.
    UnsafeTransitionDeferred,
    /// An action conflicted with the rest of the plan and was dropped.
    ActionSkipped { action: String, reason: String },
}

/// The output of the planner.
#[derive(Clone, Debug)]
pub struct Plan {
    /// The topology which results from applying all actions in order.
    pub next: Topology,
    /// The ordered actions to apply.
    pub actions: Vec<Action>,
    pub conditions: Vec<Condition>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Ordering key of a member: untagged members last, then natural machine order.
type MemberKey = (bool, Option<MachineId>, MemberId);

/// The current voting state of the peer group, partitioned by what should happen to each member.
#[derive(Default)]
struct Partition {
    /// Voters belonging to machines excluded from this plan.
    pinned: BTreeSet<MemberId>,
    /// Healthy voters which want to keep their vote.
    healthy: BTreeSet<MemberId>,
    /// Unhealthy voters which want to keep their vote.
    unhealthy: BTreeSet<MemberId>,
    /// Healthy, caught up non-voters which want a vote.
    candidates: BTreeSet<MemberId>,
    /// Voters which no longer want a vote.
    stale: BTreeSet<MemberId>,
    /// Non-voters which are no longer wanted.
    removable: BTreeSet<MemberId>,
    keys: BTreeMap<MemberId, MemberKey>,
}

impl Partition {
    fn key(&self, id: &MemberId) -> MemberKey {
        self.keys.get(id).cloned().unwrap_or((true, None, *id))
    }

    fn newest(&self, set: &BTreeSet<MemberId>) -> Option<MemberId> {
        set.iter().max_by_key(|id| self.key(id)).copied()
    }

    fn natural(&self) -> BTreeSet<MemberId> {
        self.pinned
            .iter()
            .chain(self.healthy.iter())
            .chain(self.unhealthy.iter())
            .chain(self.candidates.iter())
            .copied()
            .collect()
    }
}

/// A possible voting set, along with its tie-break attributes.
struct VotingOption {
    voters: BTreeSet<MemberId>,
    /// The number of stale voters which keep their vote.
    retained_stale: usize,
    rank: u8,
}

/// Plan the next topology of the peer group.
///
/// The voting set of the plan is odd, with two exceptions. A natural set of exactly two voters is
/// kept as is. And when no candidate voting set can be reached through quorum safe revocations,
/// the current voters are kept unchanged, even when their number is even, and
/// `Condition::UnsafeTransitionDeferred` is reported: keeping a healthy majority through every
/// step takes precedence over odd parity. Removals, address updates and additions still proceed.
pub fn plan(input: &PlanInput<'_>) -> Plan {
    let mut conditions = vec![];
    let current = input.current;
    let is_healthy = |id: &MemberId| input.status.get(id).map(|h| h.healthy).unwrap_or(false);
    let is_ready = |id: &MemberId| input.status.get(id).map(MemberHealth::is_ready).unwrap_or(false);

    let controllers: BTreeMap<&MachineId, &ControllerMachine> = input.machines.iter().filter(|m| m.is_controller()).map(|m| (&m.id, m)).collect();

    // Select the peer address of every machine which wants a vote. Machines without one are
    // excluded from this cycle, and their members are left untouched.
    let mut addresses: BTreeMap<MachineId, HostPort> = BTreeMap::new();
    let mut excluded = BTreeSet::new();
    for machine in controllers.values().filter(|m| m.wants_vote()) {
        match select_address(machine, input.machines, input.config.ha_space.as_ref()) {
            Ok(addr) => {
                addresses.insert(machine.id.clone(), addr.with_port(input.config.peer_port));
            }
            Err(err) => {
                excluded.insert(machine.id.clone());
                conditions.push(Condition::MachineExcluded {
                    machine: machine.id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    // Partition the current members.
    let mut part = Partition::default();
    for member in current.members() {
        let machine = member.machine_id();
        let owner = machine.as_ref().and_then(|id| controllers.get(id));
        let pinned = machine.as_ref().map(|id| excluded.contains(id)).unwrap_or(false);
        let wanted = owner.map(|m| m.wants_vote()).unwrap_or(false);
        part.keys.insert(member.id, (machine.is_none(), machine.clone(), member.id));
        let set = match (member.is_voter(), pinned, wanted) {
            (true, true, _) => &mut part.pinned,
            (true, false, true) if is_healthy(&member.id) => &mut part.healthy,
            (true, false, true) => &mut part.unhealthy,
            (true, false, false) => &mut part.stale,
            (false, true, _) => continue,
            (false, false, true) if is_ready(&member.id) => &mut part.candidates,
            (false, false, true) => continue, // Still catching up.
            (false, false, false) => &mut part.removable,
        };
        set.insert(member.id);
    }

    // Choose the voting set.
    let current_voters = current.voters();
    let options = voting_options(&part, &is_healthy);
    let had_options = !options.is_empty();
    let chosen = options
        .into_iter()
        .map(|opt| {
            let actions = vote_actions(current, &current_voters, &opt.voters, &part, &is_healthy);
            (opt, actions)
        })
        .filter(|(_, actions)| is_quorum_safe(&current_voters, actions, input.status))
        .min_by_key(|(opt, _)| (opt.retained_stale, current_voters.symmetric_difference(&opt.voters).count(), opt.rank));
    let (voters, mut actions) = match chosen {
        Some((opt, actions)) => (opt.voters, actions),
        None => {
            if had_options {
                conditions.push(Condition::UnsafeTransitionDeferred);
            }
            (current_voters.clone(), vec![])
        }
    };
    for id in part.stale.intersection(&voters) {
        conditions.push(Condition::StaleVoterRetained {
            member: *id,
            machine: current.member(*id).and_then(PeerGroupMember::machine_id),
        });
    }

    // Remove members which are no longer wanted, once they no longer vote.
    for id in part.stale.difference(&voters).chain(part.removable.iter()) {
        actions.push(Action::RemoveMember {
            member: *id,
            machine: current.member(*id).and_then(PeerGroupMember::machine_id),
        });
    }

    // Keep member addresses in sync with address selection.
    for (machine, address) in addresses.iter() {
        if let Some(member) = current.member_for_machine(machine) {
            if &member.address != address {
                actions.push(Action::UpdateAddress {
                    member: member.id,
                    machine: machine.clone(),
                    address: address.clone(),
                });
            }
        }
    }

    // Add non-voting members for machines which want a vote but have no member yet.
    let mut next_id = current.next_member_id();
    for (machine, address) in addresses.iter() {
        if current.member_for_machine(machine).is_none() {
            actions.push(Action::AddMember(PeerGroupMember::new_non_voting(next_id, machine, address.clone())));
            next_id = MemberId(next_id.0 + 1);
        }
    }
    actions.sort_by_key(Action::rank);

    // Replay the plan to produce the next topology, dropping anything which does not apply.
    let mut next = current.clone();
    let mut applied = Vec::with_capacity(actions.len());
    for action in actions {
        match next.apply(&action) {
            Ok(()) => applied.push(action),
            Err(err) => conditions.push(Condition::ActionSkipped {
                action: action.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    let healthy = controllers
        .values()
        .filter(|m| m.wants_vote() && !excluded.contains(&m.id))
        .filter(|m| current.member_for_machine(&m.id).map(|member| is_healthy(&member.id)).unwrap_or(false))
        .count();
    if healthy < input.config.desired_controller_count {
        conditions.push(Condition::InsufficientControllers {
            healthy,
            desired: input.config.desired_controller_count,
        });
    }

    Plan {
        next,
        actions: applied,
        conditions,
    }
}

/// Build the possible voting sets for the given partition.
fn voting_options(part: &Partition, is_healthy: &impl Fn(&MemberId) -> bool) -> Vec<VotingOption> {
    let natural = part.natural();
    if natural.is_empty() {
        return vec![];
    }

    let without = |id: MemberId| {
        let mut voters = natural.clone();
        voters.remove(&id);
        voters
    };
    let held_back = part.newest(&part.candidates);

    // Retaining stale voters lets a shrinking group step down one odd size at a time, and lets
    // candidates be granted a vote before any stale voter loses one. Healthy stale voters are
    // retained first, oldest first.
    let mut options = vec![];
    let mut stale: Vec<MemberId> = part.stale.iter().copied().collect();
    stale.sort_by_key(|id| (!is_healthy(id), part.key(id)));
    let bases = std::iter::once(natural.clone()).chain(held_back.map(without));
    for base in bases {
        for retained in 1..=stale.len() {
            if (base.len() + retained) % 2 == 0 {
                continue;
            }
            let mut voters = base.clone();
            voters.extend(stale.iter().take(retained).copied());
            options.push(VotingOption {
                voters,
                retained_stale: retained,
                rank: 2,
            });
        }
    }
    if natural.len() % 2 == 1 {
        options.push(VotingOption {
            voters: natural,
            retained_stale: 0,
            rank: 0,
        });
        return options;
    }

    if let Some(id) = held_back {
        options.push(VotingOption {
            voters: without(id),
            retained_stale: 0,
            rank: 1,
        });
    }
    if let Some(id) = part.newest(&part.unhealthy) {
        options.push(VotingOption {
            voters: without(id),
            retained_stale: 0,
            rank: 3,
        });
    }
    if let Some(id) = part.newest(&part.healthy) {
        options.push(VotingOption {
            voters: without(id),
            retained_stale: 0,
            rank: 4,
        });
    }
    // Two voters is the one even size accepted as is: dropping to a single voter is never quorum
    // safe, and keeping a demoted third voter would block its removal forever.
    if natural.len() == 2 {
        options.push(VotingOption {
            voters: natural,
            retained_stale: 0,
            rank: 5,
        });
    }
    options.retain(|opt| !opt.voters.is_empty());
    options
}

/// The ordered vote changes needed to move from `current` to `target` voters.
///
/// Unhealthy members lose their vote first, so that healthy voters are kept as long as possible.
fn vote_actions(
    topology: &Topology, current: &BTreeSet<MemberId>, target: &BTreeSet<MemberId>, part: &Partition, is_healthy: &impl Fn(&MemberId) -> bool,
) -> Vec<Action> {
    let machine_of = |id: &MemberId| topology.member(*id).and_then(PeerGroupMember::machine_id);
    let mut revoked: Vec<MemberId> = current.difference(target).copied().collect();
    revoked.sort_by_key(|id| (is_healthy(id), part.key(id)));
    let mut granted: Vec<MemberId> = target.difference(current).copied().collect();
    granted.sort_by_key(|id| part.key(id));

    let mut actions: Vec<Action> = revoked
        .into_iter()
        .map(|id| Action::RevokeVote {
            member: id,
            machine: machine_of(&id),
        })
        .collect();
    // Candidates are always tagged, as they come from wanted machines.
    actions.extend(granted.into_iter().filter_map(|id| machine_of(&id).map(|machine| Action::GrantVote { member: id, machine })));
    actions
}

/// Check that every vote revocation in `actions` keeps a healthy majority of the voters which
/// existed right before it.
pub fn is_quorum_safe(current: &BTreeSet<MemberId>, actions: &[Action], status: &HashMap<MemberId, MemberHealth>) -> bool {
    let mut voters = current.clone();
    for action in actions {
        match action.vote_change() {
            Some(false) => {
                let before = voters.len();
                voters.remove(&action.member_id());
                let healthy = voters.iter().filter(|id| status.get(id).map(|h| h.healthy).unwrap_or(false)).count();
                if healthy < before / 2 + 1 {
                    return false;
                }
            }
            Some(true) => {
                voters.insert(action.member_id());
            }
            None => (),
        }
    }
    true
}
