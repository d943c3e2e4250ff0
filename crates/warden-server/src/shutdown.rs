use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use warden_protocol::Command;

use crate::server::ControlServer;

const DRAIN_POLL: Duration = Duration::from_millis(25);

impl ControlServer {
    /// Tell every agent to exit, give them `grace` to go, then stop listening.
    ///
    /// Agents still registered when the grace period ends are closed
    /// forcibly. Calling this more than once is harmless.
    pub async fn shutdown_with_grace(&self, grace: Duration) {
        if self.draining.swap(true, Ordering::AcqRel) {
            self.stopped.cancelled().await;
            return;
        }

        let report = self.broadcast(Command::exit()).await;
        info!(
            notified = report.delivered.len(),
            failed = report.failed.len(),
            "shutting down, agents told to exit"
        );

        let deadline = Instant::now() + grace;
        while !self.registry().is_empty().await && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let remaining = self.registry().all().await;
        if !remaining.is_empty() {
            warn!(count = remaining.len(), "agents still connected after grace period");
            for session in remaining {
                self.agent_gone(&session).await;
            }
        }

        self.stopped.cancel();
        info!("shutdown complete");
    }

    pub async fn shutdown(&self) {
        self.shutdown_with_grace(self.config().shutdown_grace()).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ServerConfig;
    use crate::server::ControlServer;
    use std::time::Duration;
    use warden_protocol::CommandType;

    #[tokio::test]
    async fn stuck_agents_are_closed_after_grace() {
        let server = ControlServer::new(ServerConfig::default());
        let session = server.registry().register("erin").await.unwrap();
        server.registry().connect(&session);
        let mut queue = session.take_receiver().unwrap();

        server.shutdown_with_grace(Duration::from_millis(100)).await;

        assert!(server.is_shutting_down());
        assert!(server.registry().is_empty().await);
        assert_eq!(queue.recv().await.unwrap().kind(), CommandType::Exit);
    }

    #[tokio::test]
    async fn second_shutdown_waits_for_first() {
        let server = std::sync::Arc::new(ControlServer::new(ServerConfig::default()));
        let first = {
            let server = server.clone();
            tokio::spawn(async move { server.shutdown_with_grace(Duration::from_millis(50)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.shutdown_with_grace(Duration::from_secs(60)).await;
        first.await.unwrap();
        assert!(server.is_shutting_down());
    }
}
