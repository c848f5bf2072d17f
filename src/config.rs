//! Runtime configuration.

use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;

use crate::models::{Address, AddressScope, ControllerMachine, Life, MachineId, Role, SpaceName};
use crate::worker::WorkerConfig;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "default_rust_log")]
    pub rust_log: String,

    /// The space from which all peer addresses must be selected.
    #[serde(default)]
    pub ha_space: Option<String>,
    /// The number of controllers the operator asked for; must be odd.
    #[serde(default = "default_desired_controller_count")]
    pub desired_controller_count: usize,
    /// The port used for peer traffic between consensus store members.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    /// The quiet period used to coalesce bursts of change events.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// The maximum time a burst of change events may delay a planning cycle.
    #[serde(default = "default_max_coalesce_ms")]
    pub max_coalesce_ms: u64,
    /// The interval at which member health is re-examined without any change events.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// The first retry delay after a failed cycle.
    #[serde(default = "default_retry_first_ms")]
    pub retry_first_ms: u64,
    /// The cap on retry delays.
    #[serde(default = "default_retry_max_seconds")]
    pub retry_max_seconds: u64,
    /// The multiplicative growth of retry delays.
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,
    /// Randomize retry delays.
    #[serde(default)]
    pub retry_jitter: bool,
    /// The delay before the supervisor restarts a worker which stopped with a fatal error.
    #[serde(default = "default_restart_delay_seconds")]
    pub restart_delay_seconds: u64,

    /// The controller machines used to seed a standalone controller, as `id=address[/space]`.
    ///
    /// The first entry is the bootstrap machine.
    #[serde(default)]
    pub controller_machines: Vec<String>,
}

fn default_rust_log() -> String {
    "info".into()
}
fn default_desired_controller_count() -> usize {
    3
}
fn default_peer_port() -> u16 {
    37017
}
fn default_debounce_ms() -> u64 {
    1_000
}
fn default_max_coalesce_ms() -> u64 {
    10_000
}
fn default_poll_interval_seconds() -> u64 {
    60
}
fn default_retry_first_ms() -> u64 {
    1_000
}
fn default_retry_max_seconds() -> u64 {
    60
}
fn default_retry_factor() -> f64 {
    2.0
}
fn default_restart_delay_seconds() -> u64 {
    5
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the relationships between config values.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.desired_controller_count >= 1 && self.desired_controller_count % 2 == 1,
            "DESIRED_CONTROLLER_COUNT must be an odd number of at least 1, got {}",
            self.desired_controller_count
        );
        ensure!(
            self.max_coalesce_ms >= self.debounce_ms,
            "MAX_COALESCE_MS must be at least DEBOUNCE_MS ({} < {})",
            self.max_coalesce_ms,
            self.debounce_ms
        );
        ensure!(self.retry_factor >= 1.0, "RETRY_FACTOR must be at least 1.0, got {}", self.retry_factor);
        ensure!(self.poll_interval_seconds >= 1, "POLL_INTERVAL_SECONDS must be at least 1 second");
        Ok(())
    }

    /// The configured HA space, treating an empty value as unset.
    pub fn ha_space(&self) -> Option<SpaceName> {
        self.ha_space.as_deref().map(str::trim).filter(|space| !space.is_empty()).map(SpaceName::new)
    }

    /// The explicit configuration of the peer group worker.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            desired_controller_count: self.desired_controller_count,
            peer_port: self.peer_port,
            debounce: Duration::from_millis(self.debounce_ms),
            max_coalesce: Duration::from_millis(self.max_coalesce_ms),
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            retry_initial: Duration::from_millis(self.retry_first_ms),
            retry_max: Duration::from_secs(self.retry_max_seconds),
            retry_multiplier: self.retry_factor,
            retry_jitter: self.retry_jitter,
        }
    }

    /// Parse the controller machines used to seed a standalone controller.
    ///
    /// Every seeded machine is an alive controller which wants a vote.
    pub fn seed_machines(&self) -> Result<Vec<ControllerMachine>> {
        self.controller_machines
            .iter()
            .map(|entry| parse_seed_machine(entry).with_context(|| format!("invalid CONTROLLER_MACHINES entry {:?}", entry)))
            .collect()
    }
}

/// Parse an `id=address[/space]` machine entry.
fn parse_seed_machine(entry: &str) -> Result<ControllerMachine> {
    let (id, rest) = match entry.trim().split_once('=') {
        Some((id, rest)) if !id.is_empty() && !rest.is_empty() => (id, rest),
        _ => bail!("expected the form id=address[/space]"),
    };
    let (value, space) = match rest.split_once('/') {
        Some((value, space)) => (value, Some(SpaceName::new(space))),
        None => (rest, None),
    };
    let scope = if value.starts_with("127.") || value == "::1" || value == "localhost" {
        AddressScope::MachineLocal
    } else {
        AddressScope::CloudLocal
    };
    Ok(ControllerMachine {
        id: MachineId::new(id),
        role: Role::Controller,
        life: Life::Alive,
        addresses: vec![Address::new(value, scope, space)],
        zone: None,
        desired_vote: true,
        has_vote: false,
        intent: None,
    })
}
