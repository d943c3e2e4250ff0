//! Privileged master of the warden control plane.
//!
//! Agents running in each user session connect to [`ControlServer`], register
//! under their account name and then receive commands dispatched to that
//! user. Commands go out through a bounded per-agent queue; agents report
//! back with [`events::AgentEvent`]s.

pub mod config;
mod connection;
pub mod events;
pub mod server;
mod shutdown;

pub use config::ServerConfig;
pub use events::AgentEvent;
pub use server::{BroadcastReport, ControlServer};
