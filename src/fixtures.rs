use std::collections::HashMap;

use crate::models::{Address, AddressScope, ControllerMachine, HostPort, Life, MachineId, MemberHealth, MemberId, MemberState, PeerGroupMember, Role, SpaceName};
use crate::planner::PlanConfig;
use crate::topology::Topology;

pub const PEER_PORT: u16 = 37017;

/// The cloud-local address of the given machine, in the shared `mgmt` space.
pub fn machine_address(machine: u64) -> String {
    format!("10.0.0.{}", machine)
}

/// A live controller machine which wants a vote.
pub fn machine(id: u64) -> ControllerMachine {
    ControllerMachine {
        id: MachineId::new(id.to_string()),
        role: Role::Controller,
        life: Life::Alive,
        addresses: vec![Address::new(machine_address(id), AddressScope::CloudLocal, Some(SpaceName::new("mgmt")))],
        zone: None,
        desired_vote: true,
        has_vote: false,
        intent: None,
    }
}

/// A member of the given machine at its fixture address.
pub fn member(id: u64, machine: u64, voting: bool) -> PeerGroupMember {
    let address = HostPort {
        host: machine_address(machine),
        port: PEER_PORT,
    };
    let mut member = PeerGroupMember::new_non_voting(MemberId(id), &MachineId::new(machine.to_string()), address);
    member.set_voting(voting);
    member
}

pub fn topology(members: Vec<PeerGroupMember>) -> Topology {
    Topology::from_members(members).expect("error building fixture topology")
}

pub fn primary() -> MemberHealth {
    MemberHealth {
        healthy: true,
        state: MemberState::Primary,
    }
}

pub fn ready() -> MemberHealth {
    MemberHealth {
        healthy: true,
        state: MemberState::Secondary,
    }
}

pub fn startup() -> MemberHealth {
    MemberHealth {
        healthy: false,
        state: MemberState::Startup,
    }
}

pub fn down() -> MemberHealth {
    MemberHealth {
        healthy: false,
        state: MemberState::Down,
    }
}

pub fn statuses(entries: Vec<(u64, MemberHealth)>) -> HashMap<MemberId, MemberHealth> {
    entries.into_iter().map(|(id, health)| (MemberId(id), health)).collect()
}

pub fn plan_config() -> PlanConfig {
    PlanConfig {
        ha_space: None,
        desired_controller_count: 3,
        peer_port: PEER_PORT,
    }
}
