//! The peer group worker loop.
//!
//! The worker watches the durable model for changes to controller machines and to the HA space
//! setting, and runs a planning cycle whenever something changed. Bursts of change events are
//! coalesced: a cycle runs once no event has arrived for the debounce window, or once the first
//! event of a burst is older than the maximum coalescing delay, whichever comes first. A periodic
//! poll re-runs the cycle without any events so that member health changes are picked up.
//!
//! Every cycle re-reads all of its inputs. Failed cycles are retried with exponential backoff,
//! and a cycle which changed the peer group is always followed by another cycle which verifies
//! convergence. The only error which stops the worker is an invalid store configuration.


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::applier::PeerGroupApplier;
use crate::backend::{ConsensusStore, ControllerModel};
use crate::error::Error;
use crate::models::MachineId;
use crate::planner::{self, Condition, PlanConfig, PlanInput};
use crate::publisher::StatusPublisher;

const METRIC_CYCLES: &str = "hadron_peergroup_cycles";
const METRIC_CYCLE_ERRORS: &str = "hadron_peergroup_cycle_errors";
const METRIC_VOTING_MEMBERS: &str = "hadron_peergroup_voting_members";

/// The observable state of the worker loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for change events, the next poll or a retry.
    Idle,
    /// Change events arrived and a cycle is scheduled.
    Debouncing,
    /// Reading inputs and computing a plan.
    Planning,
    /// Writing actions to the consensus store.
    Applying,
    /// Stopped because of an unrecoverable error.
    Fatal,
}

/// Worker configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerConfig {
    /// The number of controllers the operator asked for.
    pub desired_controller_count: usize,
    /// The port used for peer traffic.
    pub peer_port: u16,
    /// The quiet period used to coalesce bursts of change events.
    pub debounce: Duration,
    /// The maximum delay between the first event of a burst and the cycle it triggers.
    pub max_coalesce: Duration,
    /// The interval of cycles which run without any change events.
    pub poll_interval: Duration,
    /// The delay before the first retry of a failed cycle.
    pub retry_initial: Duration,
    /// The cap on retry delays.
    pub retry_max: Duration,
    /// The growth of retry delays between consecutive failures.
    pub retry_multiplier: f64,
    /// Randomize retry delays by up to half of their value.
    pub retry_jitter: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            desired_controller_count: 3,
            peer_port: 37017,
            debounce: Duration::from_secs(1),
            max_coalesce: Duration::from_secs(10),
            poll_interval: Duration::from_secs(60),
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
            retry_multiplier: 2.0,
            retry_jitter: false,
        }
    }
}

impl WorkerConfig {
    /// The backoff applied between failed cycles; it never gives up.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.retry_initial,
            initial_interval: self.retry_initial,
            max_interval: self.retry_max,
            multiplier: self.retry_multiplier,
            randomization_factor: if self.retry_jitter { 0.5 } else { 0.0 },
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// A handle to a running peer group worker.
pub struct Worker {
    shutdown_tx: broadcast::Sender<()>,
    state: watch::Receiver<LoopState>,
    handle: JoinHandle<Result<()>>,
}

impl Worker {
    /// Start a new worker.
    pub fn start<S: ConsensusStore, M: ControllerModel>(store: Arc<S>, model: Arc<M>, config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (state_tx, state) = watch::channel(LoopState::Idle);
        let handle = PeerGroupWorker::new(store, model, config, shutdown_tx.clone(), state_tx).spawn();
        Self { shutdown_tx, state, handle }
    }

    /// Ask the worker to stop.
    ///
    /// An action which is already being written to the store completes first.
    pub fn kill(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Wait for the worker to stop.
    ///
    /// This is cancellation safe, but must not be called again once it has returned.
    pub async fn wait(&mut self) -> Result<()> {
        (&mut self.handle).await.context("error joining peer group worker")?
    }

    /// The current state of the worker loop.
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Subscribe to state changes of the worker loop.
    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }
}

/// The outcome of a successful cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CycleOutcome {
    /// Nothing needed to change.
    Converged,
    /// Actions were applied; another cycle must verify convergence.
    Changed,
    /// Shutdown was requested between actions.
    Interrupted,
}

/// The controller task which drives the peer group towards its desired topology.
struct PeerGroupWorker<S: ConsensusStore, M: ControllerModel> {
    config: WorkerConfig,
    model: Arc<M>,
    applier: PeerGroupApplier<S>,
    publisher: StatusPublisher<M>,

    /// Changes to controller machines.
    machines: ReceiverStream<Vec<MachineId>>,
    /// Changes to the HA space setting.
    ha_space: ReceiverStream<()>,
    /// The periodic poll.
    poll: Interval,

    /// The instant at which the next cycle runs, if one is scheduled.
    next_cycle: Option<Instant>,
    /// The arrival of the first event of the current burst.
    first_event: Option<Instant>,
    /// The earliest instant a retry may run at.
    not_before: Option<Instant>,
    /// The number of consecutive failed cycles.
    attempt: u32,
    /// The delays applied between consecutive failed cycles.
    backoff: ExponentialBackoff,

    state: watch::Sender<LoopState>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// A channel used for checking for shutdown between actions.
    shutdown_check: broadcast::Receiver<()>,
}

impl<S: ConsensusStore, M: ControllerModel> PeerGroupWorker<S, M> {
    /// Create a new instance.
    fn new(store: Arc<S>, model: Arc<M>, config: WorkerConfig, shutdown_tx: broadcast::Sender<()>, state: watch::Sender<LoopState>) -> Self {
        metrics::register_counter!(METRIC_CYCLES, metrics::Unit::Count, "peer group planning cycles");
        metrics::register_counter!(METRIC_CYCLE_ERRORS, metrics::Unit::Count, "peer group planning cycles which failed");
        metrics::register_gauge!(METRIC_VOTING_MEMBERS, metrics::Unit::Count, "voting members of the peer group");

        let machines = ReceiverStream::new(model.watch_controller_machines());
        let ha_space = ReceiverStream::new(model.watch_ha_space_config());
        let mut poll = tokio::time::interval_at(Instant::now() + config.poll_interval, config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let backoff = config.backoff();
        Self {
            applier: PeerGroupApplier::new(store),
            publisher: StatusPublisher::new(model.clone()),
            model,
            config,
            machines,
            ha_space,
            poll,
            next_cycle: Some(Instant::now()),
            first_event: None,
            not_before: None,
            attempt: 0,
            backoff,
            state,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_check: shutdown_tx.subscribe(),
        }
    }

    fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("peer group worker has started");

        loop {
            let deadline = self.next_cycle;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if !self.handle_cycle().await? {
                        break;
                    }
                }
                Some(changed) = self.machines.next() => {
                    tracing::debug!(machines = ?changed, "controller machines changed");
                    self.schedule_cycle();
                }
                Some(()) = self.ha_space.next() => {
                    tracing::debug!("HA space setting changed");
                    self.schedule_cycle();
                }
                _ = self.poll.tick() => self.schedule_cycle(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("peer group worker has shutdown");
        Ok(())
    }

    /// Schedule a cycle in response to a change event, coalescing it with any pending events.
    fn schedule_cycle(&mut self) {
        let now = Instant::now();
        let first = *self.first_event.get_or_insert(now);
        let mut deadline = std::cmp::min(now + self.config.debounce, first + self.config.max_coalesce);
        if let Some(not_before) = self.not_before {
            deadline = deadline.max(not_before);
        }
        self.next_cycle = Some(deadline);
        self.set_state(LoopState::Debouncing);
    }

    /// Run a cycle and schedule whatever comes next, returning `false` if the worker should stop.
    async fn handle_cycle(&mut self) -> Result<bool> {
        self.next_cycle = None;
        self.first_event = None;
        metrics::increment_counter!(METRIC_CYCLES);
        match self.cycle().await {
            Ok(CycleOutcome::Interrupted) => Ok(false),
            Ok(outcome) => {
                self.attempt = 0;
                self.backoff.reset();
                self.not_before = None;
                if outcome == CycleOutcome::Changed {
                    self.next_cycle = Some(Instant::now() + self.config.debounce);
                }
                self.set_state(LoopState::Idle);
                Ok(true)
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(error = %err, "peer group worker stopping on unrecoverable error");
                self.set_state(LoopState::Fatal);
                Err(err).context("peer group worker stopped")
            }
            Err(err) => {
                let delay = self.backoff.next_backoff().unwrap_or(self.backoff.max_interval);
                self.attempt = self.attempt.saturating_add(1);
                tracing::warn!(error = %err, kind = ?err.kind(), attempt = self.attempt, ?delay, "peer group cycle failed, will retry");
                metrics::increment_counter!(METRIC_CYCLE_ERRORS);
                let not_before = Instant::now() + delay;
                self.not_before = Some(not_before);
                self.next_cycle = Some(not_before);
                self.set_state(LoopState::Idle);
                Ok(true)
            }
        }
    }

    /// Read all inputs, plan, and apply the plan.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn cycle(&mut self) -> std::result::Result<CycleOutcome, Error> {
        self.set_state(LoopState::Planning);
        self.publisher.begin_cycle();
        let machines = self.model.controller_machines().await?;
        let ha_space = self.model.ha_space().await?;
        let (current, _) = self.applier.read().await?;
        let status = self.applier.status().await?;
        metrics::gauge!(METRIC_VOTING_MEMBERS, current.voting_count() as f64);

        let config = PlanConfig {
            ha_space,
            desired_controller_count: self.config.desired_controller_count,
            peer_port: self.config.peer_port,
        };
        let plan = planner::plan(&PlanInput {
            current: &current,
            status: &status,
            machines: &machines,
            config: &config,
        });

        let mut excluded = BTreeMap::new();
        for condition in plan.conditions.iter() {
            match condition {
                Condition::InsufficientControllers { healthy, desired } => {
                    tracing::warn!(healthy, desired, "fewer healthy controllers than desired");
                }
                Condition::MachineExcluded { machine, reason } => {
                    tracing::warn!(machine = %machine, reason = %reason, "machine excluded from the peer group");
                    excluded.insert(machine.clone(), reason.clone());
                }
                Condition::StaleVoterRetained { member, machine } => {
                    tracing::info!(member = %member, machine = ?machine, "retaining vote of member which no longer wants it");
                }
                Condition::UnsafeTransitionDeferred => {
                    tracing::warn!("no quorum safe change of the voting set is possible, keeping current voters");
                }
                Condition::ActionSkipped { action, reason } => {
                    tracing::warn!(action = %action, reason = %reason, "skipped conflicting action");
                }
            }
        }
        self.publisher.report_problems(&excluded).await;

        if plan.is_noop() {
            self.publisher.reconcile(&machines, &current).await;
            return Ok(CycleOutcome::Converged);
        }

        self.set_state(LoopState::Applying);
        tracing::info!(actions = plan.actions.len(), voters = plan.next.voting_count(), "applying peer group changes");
        for action in plan.actions.iter() {
            if self.shutdown_requested() {
                tracing::debug!("shutdown requested, abandoning remaining actions");
                return Ok(CycleOutcome::Interrupted);
            }
            self.applier.apply(action).await?;
            if let (Some(has_vote), Some(machine)) = (action.vote_change(), action.machine()) {
                self.publisher.publish(&machine, has_vote).await;
            }
        }

        let (after, _) = self.applier.read().await?;
        metrics::gauge!(METRIC_VOTING_MEMBERS, after.voting_count() as f64);
        self.publisher.reconcile(&machines, &after).await;
        Ok(CycleOutcome::Changed)
    }

    fn shutdown_requested(&mut self) -> bool {
        !matches!(self.shutdown_check.try_recv(), Err(broadcast::error::TryRecvError::Empty))
    }

    fn set_state(&self, state: LoopState) {
        let _ = self.state.send(state);
    }
}
