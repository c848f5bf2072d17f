//! The Hadron peer group controller.
//!
//! Keeps the replica set of a consensus store in line with the controller machines recorded in a
//! durable model: members are added, promoted, demoted and removed one quorum safe step at a time.

pub mod address;
pub mod app;
pub mod applier;
pub mod backend;
pub mod config;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod initializer;
pub mod memory;
pub mod models;
pub mod planner;
#[cfg(test)]
mod planner_test;
pub mod publisher;
pub mod topology;
pub mod worker;

pub use error::{Error, ErrorKind, Result};
