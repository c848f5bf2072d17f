//! In-memory backends.
//!
//! These back the standalone controller binary and the test suite. The store keeps a versioned
//! member configuration and supports fault injection; the model keeps controller machines and
//! records everything written back to it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backend::{ConsensusStore, ControllerModel};
use crate::error::{Error, Result};
use crate::models::{ControllerMachine, MachineId, MemberConfig, MemberHealth, MemberId, MemberState, SpaceName};

/// The capacity of watch channels handed out by the model.
const WATCH_CHANNEL_CAPACITY: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//////////////////////////////////////////////////////////////////////////////
// MemoryStore ///////////////////////////////////////////////////////////////

/// An in-memory consensus store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    config: MemberConfig,
    /// Explicit member health, overriding the default health of members.
    health: HashMap<MemberId, MemberHealth>,
    /// Report members without explicit health as healthy & caught up.
    auto_ready: bool,
    /// The number of upcoming calls which fail as unavailable.
    unavailable: u32,
    /// The number of upcoming configuration writes which race a concurrent writer.
    conflicts: u32,
    /// The number of configuration writes accepted.
    writes: u64,
    /// The number of primary step downs requested.
    step_downs: u64,
}

impl MemoryStore {
    /// Create a new empty store, whose members only become ready once given explicit health.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty store, whose members are reported healthy & caught up by default.
    ///
    /// The lowest voting member is reported as primary.
    pub fn new_auto_ready() -> Self {
        let store = Self::default();
        lock(&store.inner).auto_ready = true;
        store
    }

    /// Create a store holding the given configuration.
    pub fn with_config(config: MemberConfig) -> Self {
        let store = Self::default();
        lock(&store.inner).config = config;
        store
    }

    /// The current member configuration.
    pub fn config(&self) -> MemberConfig {
        lock(&self.inner).config.clone()
    }

    /// Set the health of a member.
    pub fn set_health(&self, member: MemberId, health: MemberHealth) {
        lock(&self.inner).health.insert(member, health);
    }

    /// Make the next `count` calls fail as if the store were unreachable.
    pub fn fail_next(&self, count: u32) {
        lock(&self.inner).unavailable = count;
    }

    /// Make the next `count` configuration writes lose a race against a concurrent writer.
    pub fn conflict_next(&self, count: u32) {
        lock(&self.inner).conflicts = count;
    }

    /// The number of configuration writes accepted so far.
    pub fn writes(&self) -> u64 {
        lock(&self.inner).writes
    }

    /// The number of primary step downs requested so far.
    pub fn step_downs(&self) -> u64 {
        lock(&self.inner).step_downs
    }
}

impl StoreState {
    fn check_available(&mut self) -> Result<()> {
        if self.unavailable > 0 {
            self.unavailable -= 1;
            return Err(Error::StoreUnavailable("injected failure".into()));
        }
        Ok(())
    }

    fn default_health(&self, member: MemberId) -> MemberHealth {
        if !self.auto_ready {
            return MemberHealth {
                healthy: false,
                state: MemberState::Startup,
            };
        }
        let primary = self.config.members.iter().filter(|m| m.is_voter()).map(|m| m.id).min();
        MemberHealth {
            healthy: true,
            state: if primary == Some(member) { MemberState::Primary } else { MemberState::Secondary },
        }
    }
}

#[async_trait]
impl ConsensusStore for MemoryStore {
    async fn get_configuration(&self) -> Result<MemberConfig> {
        let mut state = lock(&self.inner);
        state.check_available()?;
        Ok(state.config.clone())
    }

    async fn set_configuration(&self, config: MemberConfig, expected_version: u64) -> Result<()> {
        let mut state = lock(&self.inner);
        state.check_available()?;
        if state.conflicts > 0 {
            state.conflicts -= 1;
            state.config.version += 1;
        }
        if state.config.version != expected_version {
            return Err(Error::VersionConflict {
                expected: expected_version,
                found: state.config.version,
            });
        }
        let max_member_id = config.max_member_id.max(state.config.max_member_id);
        state.config = MemberConfig {
            version: expected_version + 1,
            members: config.members,
            max_member_id,
        };
        state.writes += 1;
        Ok(())
    }

    async fn member_status(&self) -> Result<HashMap<MemberId, MemberHealth>> {
        let mut state = lock(&self.inner);
        state.check_available()?;
        Ok(state
            .config
            .members
            .iter()
            .map(|m| (m.id, state.health.get(&m.id).cloned().unwrap_or_else(|| state.default_health(m.id))))
            .collect())
    }

    async fn step_down_primary(&self) -> Result<()> {
        let mut state = lock(&self.inner);
        state.check_available()?;
        state.step_downs += 1;
        for health in state.health.values_mut().filter(|h| h.state == MemberState::Primary) {
            health.state = MemberState::Secondary;
        }
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// MemoryModel ///////////////////////////////////////////////////////////////

/// An in-memory durable model.
#[derive(Default)]
pub struct MemoryModel {
    inner: Mutex<ModelState>,
}

#[derive(Default)]
struct ModelState {
    machines: BTreeMap<MachineId, ControllerMachine>,
    ha_space: Option<SpaceName>,
    messages: BTreeMap<MachineId, String>,
    /// Every vote status write, in order.
    vote_writes: Vec<(MachineId, bool)>,
    /// The number of upcoming status writes which fail.
    failing_writes: u32,
    machine_watchers: Vec<mpsc::Sender<Vec<MachineId>>>,
    ha_space_watchers: Vec<mpsc::Sender<()>>,
}

impl MemoryModel {
    /// Create a new instance holding the given machines.
    pub fn new(machines: impl IntoIterator<Item = ControllerMachine>, ha_space: Option<SpaceName>) -> Self {
        let model = Self::default();
        {
            let mut state = lock(&model.inner);
            state.machines = machines.into_iter().map(|m| (m.id.clone(), m)).collect();
            state.ha_space = ha_space;
        }
        model
    }

    /// Insert or replace a machine, notifying watchers.
    pub fn upsert_machine(&self, machine: ControllerMachine) {
        let mut state = lock(&self.inner);
        let id = machine.id.clone();
        state.machines.insert(id.clone(), machine);
        state.notify_machines(vec![id]);
    }

    /// Remove a machine, notifying watchers.
    pub fn remove_machine(&self, id: &MachineId) {
        let mut state = lock(&self.inner);
        if state.machines.remove(id).is_some() {
            state.notify_machines(vec![id.clone()]);
        }
    }

    /// Change the HA space setting, notifying watchers.
    pub fn set_ha_space(&self, space: Option<SpaceName>) {
        let mut state = lock(&self.inner);
        state.ha_space = space;
        state.ha_space_watchers.retain(|tx| !matches!(tx.try_send(()), Err(mpsc::error::TrySendError::Closed(_))));
    }

    /// Fetch a machine by ID.
    pub fn machine(&self, id: &MachineId) -> Option<ControllerMachine> {
        lock(&self.inner).machines.get(id).cloned()
    }

    /// The status message currently set on a machine.
    pub fn status_message(&self, id: &MachineId) -> Option<String> {
        lock(&self.inner).messages.get(id).cloned()
    }

    /// Every vote status write made so far, in order.
    pub fn vote_writes(&self) -> Vec<(MachineId, bool)> {
        lock(&self.inner).vote_writes.clone()
    }

    /// Make the next `count` status writes fail.
    pub fn fail_writes(&self, count: u32) {
        lock(&self.inner).failing_writes = count;
    }
}

impl ModelState {
    fn notify_machines(&mut self, changed: Vec<MachineId>) {
        // A full channel already holds a pending wake up, which is all the watcher needs.
        self.machine_watchers
            .retain(|tx| !matches!(tx.try_send(changed.clone()), Err(mpsc::error::TrySendError::Closed(_))));
    }

    fn check_write(&mut self) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(Error::Model("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ControllerModel for MemoryModel {
    fn watch_controller_machines(&self) -> mpsc::Receiver<Vec<MachineId>> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        lock(&self.inner).machine_watchers.push(tx);
        rx
    }

    fn watch_ha_space_config(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        lock(&self.inner).ha_space_watchers.push(tx);
        rx
    }

    async fn controller_machines(&self) -> Result<Vec<ControllerMachine>> {
        Ok(lock(&self.inner).machines.values().filter(|m| m.is_controller()).cloned().collect())
    }

    async fn ha_space(&self) -> Result<Option<SpaceName>> {
        Ok(lock(&self.inner).ha_space.clone())
    }

    async fn set_machine_vote_status(&self, machine: &MachineId, has_vote: bool) -> Result<()> {
        let mut state = lock(&self.inner);
        state.check_write()?;
        let record = state
            .machines
            .get_mut(machine)
            .ok_or_else(|| Error::Model(format!("machine {} not found", machine)))?;
        record.has_vote = has_vote;
        state.vote_writes.push((machine.clone(), has_vote));
        Ok(())
    }

    async fn set_machine_status_message(&self, machine: &MachineId, message: Option<String>) -> Result<()> {
        let mut state = lock(&self.inner);
        state.check_write()?;
        match message {
            Some(message) => state.messages.insert(machine.clone(), message),
            None => state.messages.remove(machine),
        };
        Ok(())
    }
}
