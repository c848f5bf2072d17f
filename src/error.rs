//! Peer group error abstractions.

use thiserror::Error;

use crate::models::{MachineId, MemberId, SpaceName};

/// A result type where the error is a peer group `Error`.
pub type Result<T> = ::std::result::Result<T, Error>;

/// The broad classes of peer group errors, which determine how the worker loop reacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried with backoff, never surfaced past the worker loop.
    Transient,
    /// Reported on the offending machine and retried on the next cycle.
    Configuration,
    /// Stops the worker; the supervisor decides what happens next.
    Fatal,
}

/// Peer group error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// A HA space is configured, but the machine has no address in it.
    #[error("machine {machine} has no address in space {space}")]
    NoAddressInSpace { machine: MachineId, space: SpaceName },
    /// No address of the machine is usable for peer traffic.
    #[error("machine {0} has no usable address for peer traffic")]
    NoUsableAddress(MachineId),
    /// The store's configuration changed since it was read.
    #[error("member configuration version conflict, expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
    /// The store could not be reached or timed out.
    #[error("consensus store unavailable: {0}")]
    StoreUnavailable(String),
    /// The durable model could not be read or written.
    #[error("durable model error: {0}")]
    Model(String),
    /// A member may not vote yet as it is not healthy and caught up.
    #[error("member {0} is not healthy and caught up")]
    MemberNotReady(MemberId),
    /// An action no longer matches the store's configuration.
    #[error("stale action: {0}")]
    StaleAction(String),
    /// The store acknowledged a change which is not visible on re-read.
    #[error("configuration change was not accepted by the store: {0}")]
    ChangeNotAccepted(String),
    /// The store returned a configuration which cannot form a valid topology.
    #[error("invalid member configuration: {0}")]
    InvalidConfiguration(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoAddressInSpace { .. } | Self::NoUsableAddress(_) => ErrorKind::Configuration,
            Self::InvalidConfiguration(_) => ErrorKind::Fatal,
            Self::VersionConflict { .. }
            | Self::StoreUnavailable(_)
            | Self::Model(_)
            | Self::MemberNotReady(_)
            | Self::StaleAction(_)
            | Self::ChangeNotAccepted(_) => ErrorKind::Transient,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
