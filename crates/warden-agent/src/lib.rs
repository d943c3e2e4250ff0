//! Per-session agent for the warden control plane.
//!
//! One agent runs inside each interactive user session. It registers with
//! the master under the session's account name and executes what it is
//! sent: screen locks, programs run as the user, and the final exit.

pub mod client;
pub mod handler;

pub use client::{Agent, AgentConfig, Rejected};
pub use handler::{CommandHandler, Flow, Handlers};
