//! Peer group topology & the atomic actions which transform it.
//!
//! A `Topology` is the validated form of a store's member configuration. It is rebuilt from the
//! store on every planning cycle and is never cached across cycles.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::error::{Error, Result};
use crate::models::{HostPort, MachineId, MemberConfig, MemberId, PeerGroupMember};

/// A validated peer group member set, along with its machine mapping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Topology {
    members: BTreeMap<MemberId, PeerGroupMember>,
    machines: BTreeMap<MachineId, MemberId>,
    /// The highest member ID ever issued to this peer group.
    max_issued: u64,
}

impl Topology {
    /// Build a topology from the given members, validating its structure.
    ///
    /// Duplicate IDs, duplicate addresses, machines claimed by more than one member and votes
    /// outside of `{0, 1}` are all structural violations.
    pub fn from_members(members: impl IntoIterator<Item = PeerGroupMember>) -> Result<Self> {
        let mut topology = Topology::default();
        let mut addresses = HashSet::new();
        for member in members {
            if member.votes > 1 {
                return Err(Error::InvalidConfiguration(format!("member {} has {} votes", member.id, member.votes)));
            }
            if !addresses.insert(member.address.clone()) {
                return Err(Error::InvalidConfiguration(format!("duplicate member address {}", member.address)));
            }
            if let Some(machine) = member.machine_id() {
                if let Some(other) = topology.machines.insert(machine.clone(), member.id) {
                    return Err(Error::InvalidConfiguration(format!(
                        "machine {} is claimed by members {} and {}",
                        machine, other, member.id
                    )));
                }
            }
            topology.max_issued = topology.max_issued.max(member.id.0);
            if let Some(dup) = topology.members.insert(member.id, member) {
                return Err(Error::InvalidConfiguration(format!("duplicate member id {}", dup.id)));
            }
        }
        Ok(topology)
    }

    /// Build a topology from a store configuration.
    pub fn from_config(config: &MemberConfig) -> Result<Self> {
        let mut topology = Self::from_members(config.members.iter().cloned())?;
        topology.max_issued = topology.max_issued.max(config.max_member_id);
        Ok(topology)
    }

    /// Render this topology as a store configuration at the given version.
    pub fn to_config(&self, version: u64) -> MemberConfig {
        MemberConfig {
            version,
            members: self.members.values().cloned().collect(),
            max_member_id: self.max_issued,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &PeerGroupMember> {
        self.members.values()
    }

    pub fn member(&self, id: MemberId) -> Option<&PeerGroupMember> {
        self.members.get(&id)
    }

    /// The member associated with the given machine, if any.
    pub fn member_for_machine(&self, machine: &MachineId) -> Option<&PeerGroupMember> {
        self.machines.get(machine).and_then(|id| self.members.get(id))
    }

    /// The IDs of all voting members.
    pub fn voters(&self) -> BTreeSet<MemberId> {
        self.members.values().filter(|m| m.is_voter()).map(|m| m.id).collect()
    }

    pub fn voting_count(&self) -> usize {
        self.members.values().filter(|m| m.is_voter()).count()
    }

    /// Whether the given machine's member currently holds a vote.
    pub fn machine_has_vote(&self, machine: &MachineId) -> bool {
        self.member_for_machine(machine).map(|m| m.is_voter()).unwrap_or(false)
    }

    /// The next unused member ID.
    ///
    /// IDs only ever grow, even across removals, so an ID is never handed to a second machine.
    pub fn next_member_id(&self) -> MemberId {
        MemberId(self.max_issued + 1)
    }

    /// Apply the given action to this topology.
    ///
    /// Applying an action which is already in effect is a no-op. An action whose preconditions no
    /// longer hold yields `Error::StaleAction`, and leaves the topology unchanged.
    pub fn apply(&mut self, action: &Action) -> Result<()> {
        if action.is_applied(self) {
            return Ok(());
        }
        match action {
            Action::RevokeVote { member, .. } | Action::GrantVote { member, .. } => {
                let voting = matches!(action, Action::GrantVote { .. });
                let target = self
                    .members
                    .get_mut(member)
                    .ok_or_else(|| Error::StaleAction(format!("member {} does not exist", member)))?;
                target.set_voting(voting);
            }
            Action::RemoveMember { member, .. } => {
                // Absent members are caught by `is_applied` above.
                if self.members.get(member).map(|m| m.is_voter()).unwrap_or(false) {
                    return Err(Error::StaleAction(format!("member {} still holds a vote", member)));
                }
                if let Some(removed) = self.members.remove(member) {
                    if let Some(machine) = removed.machine_id() {
                        self.machines.remove(&machine);
                    }
                }
            }
            Action::UpdateAddress { member, address, .. } => {
                if self.members.values().any(|m| m.id != *member && &m.address == address) {
                    return Err(Error::StaleAction(format!("address {} is already in use", address)));
                }
                let target = self
                    .members
                    .get_mut(member)
                    .ok_or_else(|| Error::StaleAction(format!("member {} does not exist", member)))?;
                target.address = address.clone();
            }
            Action::AddMember(new) => {
                if new.is_voter() {
                    return Err(Error::StaleAction(format!("member {} must be added without a vote", new.id)));
                }
                if self.members.contains_key(&new.id) {
                    return Err(Error::StaleAction(format!("member id {} is already in use", new.id)));
                }
                if self.members.values().any(|m| m.address == new.address) {
                    return Err(Error::StaleAction(format!("address {} is already in use", new.address)));
                }
                let machine = new
                    .machine_id()
                    .ok_or_else(|| Error::StaleAction(format!("member {} is not associated with a machine", new.id)))?;
                if let Some(existing) = self.machines.get(&machine) {
                    return Err(Error::StaleAction(format!("machine {} already has member {}", machine, existing)));
                }
                self.machines.insert(machine, new.id);
                self.max_issued = self.max_issued.max(new.id.0);
                self.members.insert(new.id, new.clone());
            }
        }
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Actions ///////////////////////////////////////////////////////////////////

/// A single, atomic change to the peer group.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Take the vote away from a member.
    RevokeVote { member: MemberId, machine: Option<MachineId> },
    /// Give a vote to an existing, caught up member.
    GrantVote { member: MemberId, machine: MachineId },
    /// Remove a non-voting member.
    RemoveMember { member: MemberId, machine: Option<MachineId> },
    /// Change the peer address of a member.
    UpdateAddress { member: MemberId, machine: MachineId, address: HostPort },
    /// Add a new non-voting member.
    AddMember(PeerGroupMember),
}

impl Action {
    /// The position of this action's kind in an ordered action list.
    ///
    /// Vote revocations come before grants, which come before removals, address updates and
    /// finally additions.
    pub fn rank(&self) -> u8 {
        match self {
            Self::RevokeVote { .. } => 0,
            Self::GrantVote { .. } => 1,
            Self::RemoveMember { .. } => 2,
            Self::UpdateAddress { .. } => 3,
            Self::AddMember(_) => 4,
        }
    }

    pub fn member_id(&self) -> MemberId {
        match self {
            Self::RevokeVote { member, .. }
            | Self::GrantVote { member, .. }
            | Self::RemoveMember { member, .. }
            | Self::UpdateAddress { member, .. } => *member,
            Self::AddMember(member) => member.id,
        }
    }

    /// The machine affected by this action, if the member is associated with one.
    pub fn machine(&self) -> Option<MachineId> {
        match self {
            Self::RevokeVote { machine, .. } | Self::RemoveMember { machine, .. } => machine.clone(),
            Self::GrantVote { machine, .. } | Self::UpdateAddress { machine, .. } => Some(machine.clone()),
            Self::AddMember(member) => member.machine_id(),
        }
    }

    /// The voting state this action leaves its member in, if it changes votes.
    pub fn vote_change(&self) -> Option<bool> {
        match self {
            Self::RevokeVote { .. } => Some(false),
            Self::GrantVote { .. } => Some(true),
            _ => None,
        }
    }

    /// Whether this action is already reflected in the given topology.
    pub fn is_applied(&self, topology: &Topology) -> bool {
        match self {
            Self::RevokeVote { member, .. } => topology.member(*member).map(|m| !m.is_voter()).unwrap_or(true),
            Self::GrantVote { member, .. } => topology.member(*member).map(|m| m.is_voter()).unwrap_or(false),
            Self::RemoveMember { member, .. } => topology.member(*member).is_none(),
            Self::UpdateAddress { member, address, .. } => topology.member(*member).map(|m| &m.address == address).unwrap_or(false),
            Self::AddMember(new) => topology
                .member(new.id)
                .map(|m| m.machine_id() == new.machine_id() && m.address == new.address)
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let machine = self.machine().map(|m| m.0).unwrap_or_else(|| "-".into());
        match self {
            Self::RevokeVote { member, .. } => write!(f, "revoke-vote(member={}, machine={})", member, machine),
            Self::GrantVote { member, .. } => write!(f, "grant-vote(member={}, machine={})", member, machine),
            Self::RemoveMember { member, .. } => write!(f, "remove-member(member={}, machine={})", member, machine),
            Self::UpdateAddress { member, address, .. } => write!(f, "update-address(member={}, machine={}, address={})", member, machine, address),
            Self::AddMember(member) => write!(f, "add-member(member={}, machine={}, address={})", member.id, machine, member.address),
        }
    }
}
