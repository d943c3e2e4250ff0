pub mod account;
pub mod backoff;
pub mod blocker;
pub mod error;
pub mod host;
pub mod launcher;
pub mod registry;

pub use backoff::Backoff;
pub use blocker::{Blocker, WaitOutcome};
pub use error::WardenError;
pub use host::{CommandScreenLocker, LaunchSpec, LocalSessionHost, ScreenLocker, SessionHost, SessionInfo};
pub use launcher::AgentLauncher;
pub use registry::{DEFAULT_QUEUE_CAPACITY, Registry, Session, SessionStatus};
