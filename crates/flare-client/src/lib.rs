//! # Flare Client
//!
//! Client side of Flare: keeps a presence session with the rendezvous
//! daemon, holds a relay reservation, and periodically tries to upgrade
//! relayed paths to other peers into direct connections.
//!
//! - [`rendezvous::RendezvousClient`] - authenticated ANNOUNCE / GETPEERS
//! - [`connmgr::ConnManager`] - protection tags and idle connection trimming
//! - [`orchestrator::HolePunchOrchestrator`] - the per-domain state machine
//! - [`retry`] - retry-with-backoff and shutdown-aware sleeping

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connmgr;
pub mod error;
pub mod orchestrator;
pub mod rendezvous;
pub mod retry;

pub use config::Config;
pub use connmgr::ConnManager;
pub use error::ClientError;
pub use orchestrator::{DomainSettings, HolePunchOrchestrator, Timings};
pub use rendezvous::RendezvousClient;
pub use retry::RetryPolicy;
