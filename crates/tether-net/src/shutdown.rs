//! Per-endpoint drain group.
//!
//! Every endpoint owns one [`ShutdownCoordinator`]. The token stops the
//! accept loop and seeds the child tokens of background loops. The tracker
//! holds only that endpoint's connection tasks, so a server can drain its
//! handler work while a client on the same reactor keeps running.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// How a drain ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every tracked task finished in time.
    Drained,
    /// The deadline passed with tasks still running. They stay detached.
    TimedOut {
        /// Tasks still running at the deadline.
        remaining: usize,
    },
}

impl DrainOutcome {
    /// Whether every task finished.
    pub fn is_drained(self) -> bool {
        matches!(self, Self::Drained)
    }
}

/// Cancellation plus task tracking for one endpoint.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    role: &'static str,
    token: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownCoordinator {
    /// A coordinator labelled with the endpoint `role` in its logs.
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// A clone of the endpoint token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The group connection tasks are spawned into.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Cancel the token and close the group without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
        let _ = self.tasks.close();
    }

    /// Whether the endpoint has begun shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token, close the group and wait up to `timeout` for it
    /// to empty. Safe to call more than once.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> DrainOutcome {
        self.shutdown();
        let started = Instant::now();
        debug!(role = self.role, pending = self.tasks.len(), ?timeout, "draining endpoint tasks");

        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok() {
            debug!(role = self.role, elapsed = ?started.elapsed(), "endpoint drained");
            return DrainOutcome::Drained;
        }
        let remaining = self.tasks.len();
        warn!(role = self.role, remaining, ?timeout, "endpoint drain timed out");
        DrainOutcome::TimedOut { remaining }
    }
}
