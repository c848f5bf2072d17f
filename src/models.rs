//! Peer group data models.
//!
//! These are the types shared between the planner, the applier and the worker loop. Controller
//! machines are owned by the durable model; peer group members are owned by the consensus store.
//! Neither side is ever mutated directly by this crate outside of the narrow write paths exposed
//! by the `backend` traits.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The member tag used to associate a peer group member with its controller machine.
pub const TAG_MACHINE_ID: &str = "hadron-machine-id";

//////////////////////////////////////////////////////////////////////////////
// Identifiers ///////////////////////////////////////////////////////////////

/// The identifier of a machine in the durable model.
///
/// Machine IDs are compared naturally: IDs which parse as integers are ordered numerically, so
/// that machine `10` is newer than machine `9`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(pub String);

impl MachineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Ord for MachineId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for MachineId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MachineId {
    fn from(val: &str) -> Self {
        Self(val.to_string())
    }
}

/// The store-internal identifier of a peer group member.
///
/// Once assigned to a machine's member, an ID is never reused for a different machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The name of a network space.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceName(pub String);

impl SpaceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for SpaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Addresses /////////////////////////////////////////////////////////////////

/// The reachability scope of a network address.
///
/// Variants are declared in order of preference for peer traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressScope {
    /// Reachable from within the cloud or data center.
    CloudLocal,
    /// Publicly routable.
    Public,
    /// Scope could not be determined.
    Unknown,
    /// Only reachable on the link, e.g. `fe80::/10`.
    LinkLocal,
    /// Only reachable from the machine itself, e.g. loopback.
    MachineLocal,
}

impl AddressScope {
    /// Whether an address of this scope can ever carry peer traffic.
    pub fn is_routable(&self) -> bool {
        !matches!(self, Self::LinkLocal | Self::MachineLocal)
    }
}

/// A network address of a machine, tagged with the space it belongs to (if any).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub value: String,
    pub scope: AddressScope,
    pub space: Option<SpaceName>,
}

impl Address {
    pub fn new(value: impl Into<String>, scope: AddressScope, space: Option<SpaceName>) -> Self {
        Self {
            value: value.into(),
            scope,
            space,
        }
    }

    /// Build a `HostPort` from this address using the given port.
    pub fn with_port(&self, port: u16) -> HostPort {
        HostPort {
            host: self.value.clone(),
            port,
        }
    }
}

/// A host and port pair used for peer traffic.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Controller Machines ///////////////////////////////////////////////////////

/// The lifecycle state of a machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

/// The role a machine plays in the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The machine hosts the control plane and is eligible for peer group membership.
    Controller,
    /// The machine only runs workloads and is ignored by the peer group controller.
    Workload,
}

/// An operator intent to change a machine's controller status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteIntent {
    Promote,
    Demote,
}

/// A machine as recorded in the durable model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControllerMachine {
    pub id: MachineId,
    pub role: Role,
    pub life: Life,
    /// All known addresses of the machine.
    pub addresses: Vec<Address>,
    /// The availability zone of the machine, if known.
    pub zone: Option<String>,
    /// Whether the durable model wants this machine to hold a vote.
    pub desired_vote: bool,
    /// Whether this machine's member held a vote the last time status was published.
    pub has_vote: bool,
    /// A pending promotion/demotion, which takes precedence over `desired_vote`.
    pub intent: Option<VoteIntent>,
}

impl ControllerMachine {
    /// Whether this machine should hold a vote, accounting for intent and lifecycle.
    pub fn wants_vote(&self) -> bool {
        let desired = match self.intent {
            Some(VoteIntent::Promote) => true,
            Some(VoteIntent::Demote) => false,
            None => self.desired_vote,
        };
        desired && self.life == Life::Alive && self.role == Role::Controller
    }

    pub fn is_controller(&self) -> bool {
        self.role == Role::Controller
    }
}

//////////////////////////////////////////////////////////////////////////////
// Peer Group Members ////////////////////////////////////////////////////////

/// A member of the consensus store's replica set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerGroupMember {
    pub id: MemberId,
    /// The address used for peer traffic.
    pub address: HostPort,
    /// The voting weight of the member, always 0 or 1.
    pub votes: u8,
    /// Election priority; voters carry 1 and non-voters 0.
    pub priority: u8,
    /// A tie-breaking, non-data-bearing member.
    pub arbiter: bool,
    pub tags: BTreeMap<String, String>,
}

impl PeerGroupMember {
    /// Create a new non-voting member for the given machine.
    pub fn new_non_voting(id: MemberId, machine: &MachineId, address: HostPort) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(TAG_MACHINE_ID.to_string(), machine.0.clone());
        Self {
            id,
            address,
            votes: 0,
            priority: 0,
            arbiter: false,
            tags,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.votes > 0
    }

    /// The machine this member belongs to, according to its tags.
    pub fn machine_id(&self) -> Option<MachineId> {
        self.tags.get(TAG_MACHINE_ID).map(|id| MachineId(id.clone()))
    }

    /// Set the voting state of this member, keeping priority consistent.
    pub fn set_voting(&mut self, voting: bool) {
        self.votes = u8::from(voting);
        self.priority = u8::from(voting);
    }
}

/// The member configuration of the consensus store, along with its version.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub version: u64,
    pub members: Vec<PeerGroupMember>,
    /// The highest member ID ever issued, including IDs of members since removed.
    #[serde(default)]
    pub max_member_id: u64,
}

/// The replication state of a member as reported by the consensus store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Primary,
    Secondary,
    Startup,
    Recovering,
    Arbiter,
    Down,
    Unknown(String),
}

impl MemberState {
    /// Whether a member in this state holds a current copy of the data.
    pub fn is_caught_up(&self) -> bool {
        matches!(self, Self::Primary | Self::Secondary)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("PRIMARY"),
            Self::Secondary => f.write_str("SECONDARY"),
            Self::Startup => f.write_str("STARTUP"),
            Self::Recovering => f.write_str("RECOVERING"),
            Self::Arbiter => f.write_str("ARBITER"),
            Self::Down => f.write_str("DOWN"),
            Self::Unknown(state) => f.write_str(state),
        }
    }
}

/// The health of a member as reported by the consensus store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberHealth {
    pub healthy: bool,
    pub state: MemberState,
}

impl MemberHealth {
    /// Whether the member is healthy and holds a current copy of the data.
    pub fn is_ready(&self) -> bool {
        self.healthy && self.state.is_caught_up()
    }
}
