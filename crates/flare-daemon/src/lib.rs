//! # Flare Daemon
//!
//! The rendezvous side of Flare. Peers open an authenticated presence
//! session, announce the addresses they can be reached on within a domain,
//! and ask for everyone else in that domain.
//!
//! - [`directory::PresenceDirectory`] holds the records, one session per
//!   identity, evicted when the session ends
//! - [`server::Daemon`] runs the per-session protocol loop

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod directory;
pub mod error;
pub mod server;

pub use config::Config;
pub use directory::{PresenceDirectory, SessionGuard};
pub use error::{DaemonError, DirectoryError};
pub use server::Daemon;
