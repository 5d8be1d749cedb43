use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::engine::shutdown::Shutdown;
use crate::market_data::adapters::{Gateway, GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 20, backoff: Duration::from_secs(3) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected { attempts: u32 },
    /// Every attempt was refused. Callers must not use the gateway after this.
    TimedOut { attempts: u32 },
    Cancelled,
}

/// Liveness of the link to the gateway: connect with retry, idempotent disconnect.
pub struct GatewayConnection {
    gateway: Arc<dyn Gateway>,
    policy: RetryPolicy,
    closed: AtomicBool,
}

impl GatewayConnection {
    pub fn new(gateway: Arc<dyn Gateway>, policy: RetryPolicy) -> Self {
        Self { gateway, policy, closed: AtomicBool::new(false) }
    }

    pub fn gateway(&self) -> Arc<dyn Gateway> {
        Arc::clone(&self.gateway)
    }

    pub fn is_connected(&self) -> bool {
        self.gateway.is_connected()
    }

    /// Refused attempts back off and retry up to the policy's cap; any other
    /// failure is returned straight away.
    #[instrument(skip(self, shutdown))]
    pub async fn connect(
        &self,
        client_id: i32,
        timeout: Option<Duration>,
        shutdown: &mut Shutdown,
    ) -> GatewayResult<ConnectionState> {
        let mut attempts = 0;

        while !self.gateway.is_connected() && attempts < self.policy.max_attempts {
            if shutdown.is_triggered() {
                return Ok(ConnectionState::Cancelled);
            }

            attempts += 1;
            info!(attempt = attempts, "connecting...");

            match self.gateway.connect(client_id, timeout).await {
                Ok(()) => {}
                Err(GatewayError::ConnectionRefused(reason)) => {
                    warn!(attempt = attempts, %reason, backoff_ms = self.policy.backoff.as_millis() as u64, "connection refused");
                    tokio::select! {
                        _ = tokio::time::sleep(self.policy.backoff) => {}
                        _ = shutdown.triggered() => return Ok(ConnectionState::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if self.gateway.is_connected() {
            self.closed.store(false, Ordering::SeqCst);
            info!(attempts, "Connection established");
            Ok(ConnectionState::Connected { attempts })
        } else {
            warn!(attempts, "Timeout");
            Ok(ConnectionState::TimedOut { attempts })
        }
    }

    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing....");
        self.gateway.disconnect().await;
    }
}
