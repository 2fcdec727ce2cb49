//! Broker connection management
//!
//! One `BrokerSession` owns one AMQP connection. Channels are opened per user
//! (consumer loop, RPC client) and never shared between tasks.

use std::fmt::Display;
use std::future::Future;

use lapin::{Channel, Connection, ConnectionProperties};
use rb_config::{BrokerConfig, ReconnectConfig};
use tracing::{error, info, warn};

use crate::{QueueError, Result};

pub struct BrokerSession {
    connection: Connection,
}

impl BrokerSession {
    /// Connect with bounded exponential backoff.
    ///
    /// Returns `ReconnectExhausted` once `reconnect.max_attempts` is reached.
    pub async fn connect(config: &BrokerConfig, reconnect: &ReconnectConfig) -> Result<Self> {
        let uri = config.amqp_uri();
        let connection_name = config.connection_name.clone();

        let connection = retry_with_backoff(reconnect, "broker connection", || {
            let properties =
                ConnectionProperties::default().with_connection_name(connection_name.clone().into());
            Connection::connect(&uri, properties)
        })
        .await?;

        info!(uri = %config.redacted_uri(), "Connected to broker");
        Ok(Self { connection })
    }

    pub async fn open_channel(&self) -> Result<Channel> {
        Ok(self.connection.create_channel().await?)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Close the connection if it is still open; errors are logged only
    pub async fn close(&self) {
        if !self.is_connected() {
            return;
        }
        match self.connection.close(200, "Normal shutdown").await {
            Ok(()) => info!("Broker connection closed"),
            Err(e) => warn!(error = %e, "Error closing broker connection"),
        }
    }
}

/// Run `op` until it succeeds or the attempt budget is spent
pub(crate) async fn retry_with_backoff<T, E, F, Fut>(
    policy: &ReconnectConfig,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    target_resource = what,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(target_resource = what, attempts = attempt, error = %e, "Giving up");
                return Err(QueueError::ReconnectExhausted {
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(5), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err("refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(&fast_policy(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("refused") }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            QueueError::ReconnectExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "refused");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_single_attempt_policy_does_not_retry() {
        let calls = AtomicU32::new(0);
        let _ = retry_with_backoff(&fast_policy(1), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("refused") }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
