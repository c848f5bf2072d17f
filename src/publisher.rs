//! Status publisher.
//!
//! Writes the observed voting status of controller machines back to the durable model. Failures
//! are logged and counted, but never propagated: a failed status write must not stop the peer
//! group from converging. Anything which fails to publish is retried by `reconcile` on the next
//! cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::backend::ControllerModel;
use crate::models::{ControllerMachine, MachineId};
use crate::topology::Topology;

const METRIC_PUBLISH_ERRORS: &str = "hadron_peergroup_status_publish_errors";

/// Publishes machine vote status & problems to the durable model.
pub struct StatusPublisher<M: ControllerModel> {
    model: Arc<M>,
    /// Vote status successfully written during the current cycle.
    published: HashMap<MachineId, bool>,
    /// Machines which currently carry a problem status message.
    problems: BTreeSet<MachineId>,
}

impl<M: ControllerModel> StatusPublisher<M> {
    /// Create a new instance.
    pub fn new(model: Arc<M>) -> Self {
        metrics::register_counter!(METRIC_PUBLISH_ERRORS, metrics::Unit::Count, "errors writing machine peer group status to the model");
        Self {
            model,
            published: Default::default(),
            problems: Default::default(),
        }
    }

    /// Forget what was published during the previous cycle.
    ///
    /// Called at the start of each cycle, after machines have been freshly read from the model.
    pub fn begin_cycle(&mut self) {
        self.published.clear();
    }

    /// Publish the vote status of a machine, returning `true` if the write succeeded.
    pub async fn publish(&mut self, machine: &MachineId, has_vote: bool) -> bool {
        match self.model.set_machine_vote_status(machine, has_vote).await {
            Ok(()) => {
                tracing::debug!(machine = %machine, has_vote, "published machine vote status");
                self.published.insert(machine.clone(), has_vote);
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, machine = %machine, has_vote, "error publishing machine vote status");
                metrics::increment_counter!(METRIC_PUBLISH_ERRORS);
                false
            }
        }
    }

    /// Publish the vote status of every controller machine whose recorded status disagrees with
    /// the given topology.
    pub async fn reconcile(&mut self, machines: &[ControllerMachine], topology: &Topology) {
        for machine in machines.iter().filter(|m| m.is_controller()) {
            let has_vote = topology.machine_has_vote(&machine.id);
            let recorded = self.published.get(&machine.id).copied().unwrap_or(machine.has_vote);
            if recorded != has_vote {
                self.publish(&machine.id, has_vote).await;
            }
        }
    }

    /// Surface the problems of excluded machines, clearing problems which have been resolved.
    pub async fn report_problems(&mut self, excluded: &BTreeMap<MachineId, String>) {
        for (machine, reason) in excluded.iter() {
            self.report_problem(machine, Some(reason.clone())).await;
        }
        let resolved: Vec<MachineId> = self.problems.iter().filter(|m| !excluded.contains_key(*m)).cloned().collect();
        for machine in resolved {
            self.report_problem(&machine, None).await;
        }
    }

    /// Set or clear the status message of a single machine, returning `true` if the write succeeded.
    pub async fn report_problem(&mut self, machine: &MachineId, message: Option<String>) -> bool {
        let is_set = message.is_some();
        match self.model.set_machine_status_message(machine, message).await {
            Ok(()) => {
                if is_set {
                    self.problems.insert(machine.clone());
                } else {
                    self.problems.remove(machine);
                }
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, machine = %machine, "error publishing machine status message");
                metrics::increment_counter!(METRIC_PUBLISH_ERRORS);
                false
            }
        }
    }
}
