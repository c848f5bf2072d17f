//! Peer address selection.
//!
//! Every controller machine needs exactly one address for peer traffic. When the HA space is
//! configured, the address must come from that space; otherwise we fall back to heuristics based
//! on address scope and on which spaces all controllers share.
//!
//! Selection is deterministic: candidates are always sorted by scope preference and then by
//! value, so identical inputs never cause reconfiguration churn.

use std::collections::{BTreeSet, HashSet};

use crate::error::{Error, Result};
use crate::models::{Address, AddressScope, ControllerMachine, SpaceName};

/// Select the peer address of `machine`.
///
/// `machines` should hold all controller machines (it may or may not include `machine` itself);
/// it is used to find spaces shared by every controller and to discard addresses which are not
/// unique to this machine.
pub fn select_address(machine: &ControllerMachine, machines: &[ControllerMachine], ha_space: Option<&SpaceName>) -> Result<Address> {
    if let Some(space) = ha_space {
        return first_candidate(machine.addresses.iter().filter(|addr| addr.space.as_ref() == Some(space) && addr.scope.is_routable()))
            .ok_or_else(|| Error::NoAddressInSpace {
                machine: machine.id.clone(),
                space: space.clone(),
            });
    }

    let controllers: Vec<&ControllerMachine> = machines
        .iter()
        .filter(|m| m.is_controller() && m.id != machine.id)
        .chain(std::iter::once(machine))
        .collect();

    // Prefer a cloud-local address in a space which every controller has a cloud-local address in.
    let shared = shared_cloud_local_spaces(&controllers);
    let shared_candidate = first_candidate(machine.addresses.iter().filter(|addr| {
        addr.scope == AddressScope::CloudLocal && addr.space.as_ref().map(|space| shared.contains(space)).unwrap_or(false)
    }));
    if let Some(addr) = shared_candidate {
        return Ok(addr);
    }

    // Otherwise fall back to any routable address which no other controller also claims.
    let foreign: HashSet<&str> = controllers
        .iter()
        .filter(|m| m.id != machine.id)
        .flat_map(|m| m.addresses.iter().map(|addr| addr.value.as_str()))
        .collect();
    first_candidate(machine.addresses.iter().filter(|addr| addr.scope.is_routable() && !foreign.contains(addr.value.as_str())))
        .ok_or_else(|| Error::NoUsableAddress(machine.id.clone()))
}

/// The spaces in which every given controller has a cloud-local address.
fn shared_cloud_local_spaces(controllers: &[&ControllerMachine]) -> BTreeSet<SpaceName> {
    let mut per_machine = controllers.iter().map(|m| {
        m.addresses
            .iter()
            .filter(|addr| addr.scope == AddressScope::CloudLocal)
            .filter_map(|addr| addr.space.clone())
            .collect::<BTreeSet<_>>()
    });
    let first = match per_machine.next() {
        Some(first) => first,
        None => return BTreeSet::new(),
    };
    per_machine.fold(first, |acc, spaces| acc.intersection(&spaces).cloned().collect())
}

/// Pick the most preferred of the given candidates, deterministically.
fn first_candidate<'a>(candidates: impl Iterator<Item = &'a Address>) -> Option<Address> {
    candidates.min_by(|a, b| a.scope.cmp(&b.scope).then_with(|| a.value.cmp(&b.value))).cloned()
}
