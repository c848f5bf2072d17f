//! Member applier.
//!
//! The applier is the only component which writes to the consensus store. Every call to `apply`
//! re-reads the store's configuration, so applying an action a second time (e.g. after an
//! ambiguous acknowledgement) is a no-op, and every write is guarded by the store's version check.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::ConsensusStore;
use crate::error::{Error, Result};
use crate::models::{MemberHealth, MemberId, MemberState};
use crate::topology::{Action, Topology};

const METRIC_ACTIONS_APPLIED: &str = "hadron_peergroup_actions_applied";

/// The outcome of applying an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The store's configuration was changed.
    Changed,
    /// The action was already reflected in the store; nothing was written.
    AlreadyInEffect,
}

/// Reads and writes the member configuration of a consensus store.
pub struct PeerGroupApplier<S: ConsensusStore> {
    store: Arc<S>,
}

impl<S: ConsensusStore> PeerGroupApplier<S> {
    /// Create a new instance.
    pub fn new(store: Arc<S>) -> Self {
        metrics::register_counter!(METRIC_ACTIONS_APPLIED, metrics::Unit::Count, "peer group configuration changes written to the consensus store");
        Self { store }
    }

    /// Read the authoritative topology from the store, along with its configuration version.
    ///
    /// A configuration which does not form a valid topology, including an empty one, is an
    /// invariant violation.
    pub async fn read(&self) -> Result<(Topology, u64)> {
        let config = self.store.get_configuration().await?;
        if config.members.is_empty() {
            return Err(Error::InvalidConfiguration("the store reports no members".into()));
        }
        let topology = Topology::from_config(&config)?;
        Ok((topology, config.version))
    }

    /// Read the health of all members.
    pub async fn status(&self) -> Result<HashMap<MemberId, MemberHealth>> {
        self.store.member_status().await
    }

    /// Apply a single action to the store.
    #[tracing::instrument(level = "debug", skip(self, action), fields(action = %action))]
    pub async fn apply(&self, action: &Action) -> Result<Applied> {
        let (topology, version) = self.read().await?;
        if action.is_applied(&topology) {
            tracing::debug!("action already in effect");
            return Ok(Applied::AlreadyInEffect);
        }

        match action {
            Action::GrantVote { member, .. } => {
                let status = self.store.member_status().await?;
                if !status.get(member).map(MemberHealth::is_ready).unwrap_or(false) {
                    return Err(Error::MemberNotReady(*member));
                }
            }
            Action::RevokeVote { member, .. } => {
                let status = self.store.member_status().await?;
                if status.get(member).map(|h| h.state == MemberState::Primary).unwrap_or(false) {
                    tracing::info!(member = %member, "asking primary to step down before revoking its vote");
                    self.store.step_down_primary().await?;
                }
            }
            _ => (),
        }

        let mut next = topology;
        next.apply(action)?;
        self.store.set_configuration(next.to_config(version), version).await?;

        // Verify that the store accepted the change.
        let (after, _) = self.read().await?;
        if !action.is_applied(&after) {
            return Err(Error::ChangeNotAccepted(action.to_string()));
        }
        metrics::increment_counter!(METRIC_ACTIONS_APPLIED);
        tracing::info!("peer group configuration updated");
        Ok(Applied::Changed)
    }
}
