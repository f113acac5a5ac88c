//! Core of a distributed asynchronous tasking runtime for HPC: active
//! message dispatch, a location manager for migratable entities, virtual
//! contexts and collections, epoch-scoped termination detection, and the
//! cooperative scheduler that drives it all without blocking a thread.
//!
//! This crate does not ship a transport; embed it over the
//! [`transport::Transport`] trait. A loopback implementation
//! ([`transport::MemoryTransport`]) is available behind the
//! `memory-transport` feature (on by default) for tests and
//! single-process use.

pub mod config;
pub mod context;
pub mod envelope;
pub mod epoch;
pub mod event;
pub mod location;
pub mod messenger;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod topology;
pub mod transport;
pub mod types;

pub use config::{MessengerConfig, RuntimeConfig, SchedulerConfig};
pub use runtime::{fatal, Runtime, RuntimeError};
