//! Reconnect supervision for closed connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::RemotingError;

/// Something that can lose its connection and re-establish it.
#[async_trait]
pub trait Reconnect: Send + Sync {
    /// Address used in log lines.
    fn target(&self) -> &str;

    /// Resolves when the current connection has closed.
    async fn closed(&self);

    /// Establishes a fresh connection.
    async fn reconnect(&self) -> Result<(), RemotingError>;
}

/// Retry schedule for reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures after which the supervisor gives up.
    pub max_fail_count: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_fail_count: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the attempt following `failures` consecutive failures.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Why a supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    Cancelled,
    GaveUp { attempts: u32 },
}

/// Waits for the connection to close, then reconnects with growing delays.
#[derive(Debug, Clone, Default)]
pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
}

impl ReconnectSupervisor {
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    pub async fn run(self, target: Arc<dyn Reconnect>, cancel: CancellationToken) -> SupervisorExit {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return SupervisorExit::Cancelled,
                () = target.closed() => {}
            }
            warn!(target = target.target(), "connection closed, reconnecting");

            let mut failures = 0;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return SupervisorExit::Cancelled,
                    () = tokio::time::sleep(self.policy.delay(failures)) => {}
                }

                match target.reconnect().await {
                    Ok(()) => {
                        info!(target = target.target(), attempts = failures + 1, "reconnected");
                        break;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            target = target.target(),
                            attempt = failures,
                            error = %e,
                            "reconnect failed"
                        );
                        if failures >= self.policy.max_fail_count {
                            error!(
                                target = target.target(),
                                attempts = failures,
                                "giving up on reconnect"
                            );
                            return SupervisorExit::GaveUp { attempts: failures };
                        }
                    }
                }
            }
        }
    }
}
