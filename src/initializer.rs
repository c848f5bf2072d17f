//! Peer group bootstrap.

use crate::address::select_address;
use crate::backend::ConsensusStore;
use crate::error::{Error, Result};
use crate::models::{ControllerMachine, MemberId, PeerGroupMember, SpaceName};
use crate::topology::Topology;

/// The member ID given to the bootstrap controller.
pub const BOOTSTRAP_MEMBER_ID: MemberId = MemberId(1);

/// Seed a brand new consensus store with a single voting member for the bootstrap machine.
///
/// If the store already has members this is a no-op which returns the current topology, as
/// bootstrap may be retried by an operator. Errors are returned to the caller, which decides
/// whether bootstrap should be retried.
#[tracing::instrument(level = "debug", skip(store, machine), fields(machine = %machine.id))]
pub async fn initialize<S: ConsensusStore>(store: &S, machine: &ControllerMachine, ha_space: Option<&SpaceName>, peer_port: u16) -> Result<Topology> {
    let config = store.get_configuration().await?;
    if !config.members.is_empty() {
        tracing::info!(members = config.members.len(), "peer group already initialized");
        return Topology::from_config(&config);
    }

    let address = select_address(machine, std::slice::from_ref(machine), ha_space)?.with_port(peer_port);
    let mut member = PeerGroupMember::new_non_voting(BOOTSTRAP_MEMBER_ID, &machine.id, address);
    member.set_voting(true);
    let topology = Topology::from_members(vec![member])?;
    store.set_configuration(topology.to_config(config.version), config.version).await?;

    let written = Topology::from_config(&store.get_configuration().await?)?;
    if written != topology {
        return Err(Error::ChangeNotAccepted("bootstrap member configuration".into()));
    }
    tracing::info!("peer group initialized");
    Ok(written)
}
