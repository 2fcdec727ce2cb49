//! Request/reply client
//!
//! Caller side of the bridge. Each request carries a fresh correlation id and the
//! client's exclusive reply queue; a single router task completes the waiting
//! request whose id matches an incoming reply. Replies for unknown or expired ids
//! are dropped.
//!
//! A request that is abandoned (timed out, or its future dropped) is forgotten
//! immediately. When the router stops, every waiting request fails with
//! `ConnectionClosed` and [`GatewayClient`] opens a fresh connection on the next call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, Consumer};
use parking_lot::RwLock;
use rb_common::{Envelope, ReplyEnvelope};
use rb_config::{BrokerConfig, ReconnectConfig};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::BrokerSession;
use crate::{QueueError, Result};

/// Sends an envelope to a queue and waits for the correlated reply
#[async_trait]
pub trait RpcCaller: Send + Sync {
    async fn call(&self, queue: &str, envelope: &Envelope) -> Result<ReplyEnvelope>;

    /// Whether a call made now has a live connection to go out on
    fn is_ready(&self) -> bool {
        true
    }
}

/// Correlation id to waiting request
#[derive(Clone, Default)]
pub struct PendingReplies {
    waiting: Arc<DashMap<String, oneshot::Sender<Vec<u8>>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a new correlation id
    pub fn register(&self) -> (String, oneshot::Receiver<Vec<u8>>) {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(correlation_id.clone(), tx);
        (correlation_id, rx)
    }

    /// Hand a reply body to its waiter. Returns false if nobody is waiting.
    pub fn complete(&self, correlation_id: &str, body: Vec<u8>) -> bool {
        match self.waiting.remove(correlation_id) {
            Some((_, tx)) => tx.send(body).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, correlation_id: &str) {
        self.waiting.remove(correlation_id);
    }

    /// Fail every waiting request with `ConnectionClosed`
    pub fn fail_all(&self) -> usize {
        let failed = self.waiting.len();
        self.waiting.clear();
        failed
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Wait for the reply to `correlation_id`, forgetting it on timeout
    pub async fn wait(
        &self,
        correlation_id: &str,
        rx: oneshot::Receiver<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let _forget = ForgetOnDrop::new(self, correlation_id);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(QueueError::ConnectionClosed),
            Err(_) => Err(QueueError::RpcTimeout(timeout)),
        }
    }
}

/// Removes a request from [`PendingReplies`] when the caller stops waiting for it
struct ForgetOnDrop<'a> {
    pending: &'a PendingReplies,
    correlation_id: &'a str,
}

impl<'a> ForgetOnDrop<'a> {
    fn new(pending: &'a PendingReplies, correlation_id: &'a str) -> Self {
        Self {
            pending,
            correlation_id,
        }
    }
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.correlation_id);
    }
}

pub struct RpcClient {
    channel: Channel,
    reply_queue: String,
    pending: PendingReplies,
    timeout: Duration,
    router: JoinHandle<()>,
}

impl RpcClient {
    /// Open a dedicated channel with a server-named reply queue on `connection`
    pub async fn connect(connection: &Connection, timeout: Duration) -> Result<Self> {
        let channel = connection.create_channel().await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let reply_queue = queue.name().as_str().to_string();

        let consumer = channel
            .basic_consume(
                &reply_queue,
                "rb-rpc-replies",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let pending = PendingReplies::new();
        let router = tokio::spawn(route_replies(consumer, pending.clone()));

        info!(reply_queue = %reply_queue, "RPC client ready");
        Ok(Self {
            channel,
            reply_queue,
            pending,
            timeout,
            router,
        })
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// False once the reply router has stopped or the channel is gone
    pub fn is_alive(&self) -> bool {
        !self.router.is_finished() && self.channel.status().connected()
    }
}

#[async_trait]
impl RpcCaller for RpcClient {
    async fn call(&self, queue: &str, envelope: &Envelope) -> Result<ReplyEnvelope> {
        let body = serde_json::to_vec(envelope)?;
        let (correlation_id, rx) = self.pending.register();
        let _forget = ForgetOnDrop::new(&self.pending, &correlation_id);

        let properties = BasicProperties::default()
            .with_correlation_id(ShortString::from(correlation_id.clone()))
            .with_reply_to(ShortString::from(self.reply_queue.clone()))
            .with_content_type(ShortString::from("application/json"));

        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), &body, properties)
            .await?
            .await?;

        debug!(queue = %queue, correlation_id = %correlation_id, "Request published");

        let reply = self.pending.wait(&correlation_id, rx, self.timeout).await?;
        serde_json::from_slice(&reply).map_err(|e| QueueError::InvalidReply(e.to_string()))
    }

    fn is_ready(&self) -> bool {
        self.is_alive()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.router.abort();
    }
}

async fn route_replies(mut consumer: Consumer, pending: PendingReplies) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(error = %e, "Reply consumer failed");
                break;
            }
        };

        let Some(correlation_id) = delivery.properties.correlation_id().as_ref() else {
            debug!("Dropping reply without correlation id");
            continue;
        };

        if !pending.complete(correlation_id.as_str(), delivery.data) {
            debug!(correlation_id = %correlation_id.as_str(), "Dropping reply for unknown request");
        }
    }

    let failed = pending.fail_all();
    if failed > 0 {
        warn!(failed, "Reply router stopped with requests in flight");
    } else {
        debug!("Reply router stopped");
    }
}

// ============================================================================
// Gateway Client
// ============================================================================

struct GatewayConnection {
    session: BrokerSession,
    client: Arc<RpcClient>,
}

/// [`RpcClient`] on a connection of its own, reopened when it dies.
///
/// Reconnects happen on the next call, with the same backoff as the consumer
/// side, and count against that call's timeout.
pub struct GatewayClient {
    broker: BrokerConfig,
    reconnect: ReconnectConfig,
    timeout: Duration,
    connection: Mutex<Option<GatewayConnection>>,
    current: RwLock<Option<Arc<RpcClient>>>,
}

impl GatewayClient {
    /// Create without connecting; the first call opens the connection
    pub fn new(broker: BrokerConfig, reconnect: ReconnectConfig, timeout: Duration) -> Self {
        Self {
            broker,
            reconnect,
            timeout,
            connection: Mutex::new(None),
            current: RwLock::new(None),
        }
    }

    /// Create and connect right away
    pub async fn connect(
        broker: BrokerConfig,
        reconnect: ReconnectConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let gateway = Self::new(broker, reconnect, timeout);
        gateway.client().await?;
        Ok(gateway)
    }

    async fn client(&self) -> Result<Arc<RpcClient>> {
        if let Some(client) = self.live_client() {
            return Ok(client);
        }

        let mut connection = self.connection.lock().await;
        if let Some(client) = self.live_client() {
            return Ok(client);
        }

        if let Some(stale) = connection.take() {
            warn!("Gateway connection lost, reconnecting");
            *self.current.write() = None;
            stale.session.close().await;
        }

        let session = BrokerSession::connect(&self.broker, &self.reconnect).await?;
        let client = match RpcClient::connect(session.connection(), self.timeout).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        *self.current.write() = Some(client.clone());
        *connection = Some(GatewayConnection {
            session,
            client: client.clone(),
        });
        Ok(client)
    }

    fn live_client(&self) -> Option<Arc<RpcClient>> {
        self.current
            .read()
            .as_ref()
            .filter(|client| client.is_alive())
            .cloned()
    }

    pub async fn close(&self) {
        *self.current.write() = None;
        if let Some(gateway) = self.connection.lock().await.take() {
            drop(gateway.client);
            gateway.session.close().await;
        }
    }
}

#[async_trait]
impl RpcCaller for GatewayClient {
    async fn call(&self, queue: &str, envelope: &Envelope) -> Result<ReplyEnvelope> {
        let client = tokio::time::timeout(self.timeout, self.client())
            .await
            .map_err(|_| QueueError::RpcTimeout(self.timeout))??;
        client.call(queue, envelope).await
    }

    fn is_ready(&self) -> bool {
        self.live_client().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_delivers_to_waiter() {
        let pending = PendingReplies::new();
        let (id, rx) = pending.register();
        assert_eq!(pending.len(), 1);

        assert!(pending.complete(&id, b"{\"result\":5}".to_vec()));
        let body = pending.wait(&id, rx, Duration::from_secs(1)).await.unwrap();

        assert_eq!(body, b"{\"result\":5}");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_wait_is_pending_until_reply_arrives() {
        let pending = PendingReplies::new();
        let (id, rx) = pending.register();

        let mut wait = tokio_test::task::spawn(pending.wait(&id, rx, Duration::from_secs(60)));
        tokio_test::assert_pending!(wait.poll());

        assert!(pending.complete(&id, b"{}".to_vec()));
        assert!(wait.is_woken());
        let body = tokio_test::assert_ready_ok!(wait.poll());
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn test_unknown_correlation_id_is_dropped() {
        let pending = PendingReplies::new();
        let (_id, _rx) = pending.register();

        assert!(!pending.complete("not-a-request", Vec::new()));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_forgets_request() {
        let pending = PendingReplies::new();
        let (id, rx) = pending.register();

        let err = pending
            .wait(&id, rx, Duration::from_millis(10))
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::RpcTimeout(_)));
        assert!(pending.is_empty());
        assert!(!pending.complete(&id, Vec::new()));
    }

    #[tokio::test]
    async fn test_dropped_wait_forgets_request() {
        let pending = PendingReplies::new();
        let (id, rx) = pending.register();

        let waiter = pending.clone();
        let handle = tokio::spawn(async move {
            waiter.wait(&id, rx, Duration::from_secs(60)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pending.len(), 1);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let pending = PendingReplies::new();
        let (a, rx_a) = pending.register();
        let (b, rx_b) = pending.register();

        let mut wait_a = tokio_test::task::spawn(pending.wait(&a, rx_a, Duration::from_secs(60)));
        let mut wait_b = tokio_test::task::spawn(pending.wait(&b, rx_b, Duration::from_secs(60)));
        tokio_test::assert_pending!(wait_a.poll());
        tokio_test::assert_pending!(wait_b.poll());

        assert_eq!(pending.fail_all(), 2);
        assert!(wait_a.is_woken());

        let err = tokio_test::assert_ready_err!(wait_a.poll());
        assert!(matches!(err, QueueError::ConnectionClosed));
        let err = tokio_test::assert_ready_err!(wait_b.poll());
        assert!(matches!(err, QueueError::ConnectionClosed));
        assert!(pending.is_empty());
    }

    fn unreachable_gateway() -> GatewayClient {
        let broker = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };
        let reconnect = ReconnectConfig {
            max_attempts: 1,
            initial_delay_ms: 1,
            max_delay_ms: 1,
        };
        GatewayClient::new(broker, reconnect, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_gateway_not_ready_before_connecting() {
        let gateway = unreachable_gateway();
        assert!(!gateway.is_ready());
    }

    #[tokio::test]
    async fn test_gateway_call_reports_unreachable_broker() {
        let gateway = unreachable_gateway();
        let envelope = Envelope::new("{\"cmd\":\"add\"}", serde_json::Map::new());

        let err = gateway.call("math_queue", &envelope).await.unwrap_err();

        assert!(matches!(err, QueueError::ReconnectExhausted { attempts: 1, .. }));
        assert!(!gateway.is_ready());
        gateway.close().await;
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let pending = PendingReplies::new();
        let (a, _ra) = pending.register();
        let (b, _rb) = pending.register();
        assert_ne!(a, b);
        assert_eq!(pending.len(), 2);
    }
}
