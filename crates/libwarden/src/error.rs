use thiserror::Error;
use warden_protocol::ErrorCode;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("user {0} already has a registered agent")]
    DuplicateUser(String),

    #[error("no connected agent for user {0}")]
    NotConnected(String),

    #[error("outbound queue full for user {0}")]
    QueueFull(String),

    #[error("agent launch failed: {0}")]
    LaunchFailed(String),

    #[error("action failed for user {0}")]
    ActionFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            WardenError::DuplicateUser(_) => (ErrorCode::DuplicateUser, self.to_string()),
            WardenError::NotConnected(_) => (ErrorCode::NotConnected, self.to_string()),
            WardenError::QueueFull(_) => (ErrorCode::QueueFull, self.to_string()),
            WardenError::LaunchFailed(_) => (ErrorCode::ActionFailed, "action failed".to_string()),
            WardenError::ActionFailed(_) => (ErrorCode::ActionFailed, "action failed".to_string()),
            WardenError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_and_io_errors_are_sanitized() {
        let (code, msg) = WardenError::LaunchFailed("CreateProcessAsUser: 1314".into()).to_error_code();
        assert_eq!(code, ErrorCode::ActionFailed);
        assert_eq!(msg, "action failed");

        let io = std::io::Error::other("pipe /secret/path broken");
        let (code, msg) = WardenError::from(io).to_error_code();
        assert_eq!(code, ErrorCode::ServerError);
        assert!(!msg.contains("secret"));
    }

    #[test]
    fn dispatch_errors_keep_username() {
        let (code, msg) = WardenError::QueueFull("bob".into()).to_error_code();
        assert_eq!(code, ErrorCode::QueueFull);
        assert!(msg.contains("bob"));
    }
}
