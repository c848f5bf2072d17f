//! Interfaces of the external collaborators used by the peer group controller.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::{ControllerMachine, MachineId, MemberConfig, MemberHealth, MemberId, SpaceName};

/// The consensus store whose replica set is being managed.
///
/// The store is the source of truth for member configuration, and uses its configuration version
/// for optimistic concurrency control.
#[async_trait]
pub trait ConsensusStore: Send + Sync + 'static {
    /// Fetch the current member configuration, along with its version.
    async fn get_configuration(&self) -> Result<MemberConfig>;

    /// Replace the member configuration.
    ///
    /// Fails with `Error::VersionConflict` if the configuration has changed since
    /// `expected_version`.
    async fn set_configuration(&self, config: MemberConfig, expected_version: u64) -> Result<()>;

    /// Fetch the health of every member known to the store.
    async fn member_status(&self) -> Result<HashMap<MemberId, MemberHealth>>;

    /// Ask the current primary to step down.
    ///
    /// Stores which do not allow the vote of their primary to be revoked should override this.
    async fn step_down_primary(&self) -> Result<()> {
        Ok(())
    }
}

/// The durable model holding controller machines and controller configuration.
#[async_trait]
pub trait ControllerModel: Send + Sync + 'static {
    /// Subscribe to changes of controller machines; each item holds the IDs of changed machines.
    fn watch_controller_machines(&self) -> mpsc::Receiver<Vec<MachineId>>;

    /// Subscribe to changes of the HA space setting.
    fn watch_ha_space_config(&self) -> mpsc::Receiver<()>;

    /// Fetch all controller machines.
    async fn controller_machines(&self) -> Result<Vec<ControllerMachine>>;

    /// Fetch the current HA space setting.
    async fn ha_space(&self) -> Result<Option<SpaceName>>;

    /// Record whether the given machine's member currently holds a vote.
    async fn set_machine_vote_status(&self, machine: &MachineId, has_vote: bool) -> Result<()>;

    /// Set or clear a status message describing why a machine is not part of the peer group.
    async fn set_machine_status_message(&self, _machine: &MachineId, _message: Option<String>) -> Result<()> {
        Ok(())
    }
}
