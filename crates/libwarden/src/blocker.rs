use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why [`Blocker::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Canceled,
    TimedOut,
}

struct Armed {
    deadline: Instant,
    token: CancellationToken,
}

/// A wait that ends at a deadline or as soon as someone cancels it.
pub struct Blocker {
    armed: Mutex<Armed>,
}

impl Blocker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            armed: Mutex::new(Armed {
                deadline: Instant::now() + timeout,
                token: CancellationToken::new(),
            }),
        }
    }

    fn armed(&self) -> MutexGuard<'_, Armed> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn wait(&self) -> WaitOutcome {
        let (deadline, token) = {
            let armed = self.armed();
            (armed.deadline, armed.token.clone())
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => WaitOutcome::Canceled,
            _ = tokio::time::sleep_until(deadline) => WaitOutcome::TimedOut,
        }
    }

    pub fn cancel(&self) {
        self.armed().token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.armed().token.is_cancelled()
    }

    /// Release current waiters and rearm with a fresh deadline.
    pub fn reset(&self, timeout: Duration) {
        let mut armed = self.armed();
        armed.token.cancel();
        armed.token = CancellationToken::new();
        armed.deadline = Instant::now() + timeout;
    }
}
