//! Queue Consumer
//!
//! Per-delivery protocol:
//! 1. decode the body and dispatch it for the queue it arrived on
//! 2. on success publish the reply to `reply_to`, stamped with the caller's `correlation_id`
//! 3. on failure log (and optionally dead-letter) without replying
//! 4. acknowledge the delivery exactly once, whatever happened above
//!
//! Failed messages are never redelivered. Callers that sent an invalid request
//! receive nothing and must time out on their side.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use rb_common::{BridgeError, CorrelationContext, ErrorKind, QueueRegistration};
use rb_config::ConsumerConfig;
use rb_dispatch::Dispatcher;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{QueueError, Result};

const JSON_CONTENT_TYPE: &str = "application/json";

// ============================================================================
// Broker seams
// ============================================================================

/// Single-use acknowledgement of one delivery.
///
/// Consuming `self` makes a second ack of the same delivery unrepresentable.
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// Outbound operations on the consumer's channel
#[async_trait]
pub trait ReplyPublisher: Send + Sync {
    async fn publish_reply(&self, context: &CorrelationContext, body: Vec<u8>) -> Result<()>;

    async fn publish_dead_letter(
        &self,
        exchange: &str,
        queue: &str,
        body: &[u8],
        error: &BridgeError,
    ) -> Result<()>;
}

/// A message received from one of the registered queues
pub struct InboundDelivery {
    pub queue: String,
    pub body: Vec<u8>,
    pub correlation: Option<CorrelationContext>,
    pub acker: Box<dyn Acknowledge>,
}

impl InboundDelivery {
    pub fn from_lapin(queue: String, delivery: Delivery) -> Self {
        let Delivery { data, properties, acker, .. } = delivery;

        let correlation = CorrelationContext::from_properties(
            properties.reply_to().as_ref().map(|s| s.as_str()),
            properties.correlation_id().as_ref().map(|s| s.as_str()),
        );

        Self {
            queue,
            body: data,
            correlation,
            acker: Box::new(DeliveryAcker(acker)),
        }
    }
}

struct DeliveryAcker(Acker);

#[async_trait]
impl Acknowledge for DeliveryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

/// Publishes replies on the consumer's own channel
pub struct ChannelPublisher {
    channel: Channel,
}

impl ChannelPublisher {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ReplyPublisher for ChannelPublisher {
    async fn publish_reply(&self, context: &CorrelationContext, body: Vec<u8>) -> Result<()> {
        let mut properties =
            BasicProperties::default().with_content_type(ShortString::from(JSON_CONTENT_TYPE));
        if let Some(id) = &context.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(id.clone()));
        }

        self.channel
            .basic_publish(
                "",
                &context.reply_to,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn publish_dead_letter(
        &self,
        exchange: &str,
        queue: &str,
        body: &[u8],
        error: &BridgeError,
    ) -> Result<()> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("x-bridge-queue"),
            AMQPValue::LongString(queue.into()),
        );
        headers.insert(
            ShortString::from("x-bridge-error"),
            AMQPValue::LongString(error.to_string().into()),
        );

        self.channel
            .basic_publish(
                exchange,
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_headers(headers),
            )
            .await?
            .await?;
        Ok(())
    }
}

// ============================================================================
// Message Handler
// ============================================================================

/// What happened to one delivery (it is acknowledged in every case)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Reply published to the caller
    Replied,
    /// Processed, but the message named no reply destination
    NoReplyAddress,
    /// Dispatch failed; no reply sent
    Rejected(ErrorKind),
    /// Dispatch succeeded but the reply could not be published
    ReplyFailed,
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Replied => "replied",
            DeliveryOutcome::NoReplyAddress => "no_reply_address",
            DeliveryOutcome::Rejected(kind) => kind.as_str(),
            DeliveryOutcome::ReplyFailed => "reply_failed",
        }
    }
}

pub struct MessageHandler {
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<dyn ReplyPublisher>,
    dead_letter_exchange: Option<String>,
}

impl MessageHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, publisher: Arc<dyn ReplyPublisher>) -> Self {
        Self {
            dispatcher,
            publisher,
            dead_letter_exchange: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: Option<String>) -> Self {
        self.dead_letter_exchange = exchange;
        self
    }

    /// Run the full protocol for one delivery, acknowledging it exactly once
    pub async fn handle(&self, delivery: InboundDelivery) -> DeliveryOutcome {
        let InboundDelivery {
            queue,
            body,
            correlation,
            acker,
        } = delivery;

        let outcome = self.process(&queue, &body, correlation.as_ref()).await;

        if let Err(e) = acker.ack().await {
            error!(queue = %queue, error = %e, "Failed to acknowledge message");
        }

        metrics::counter!("rb_messages_total", "queue" => queue, "outcome" => outcome.label())
            .increment(1);
        outcome
    }

    async fn process(
        &self,
        queue: &str,
        body: &[u8],
        correlation: Option<&CorrelationContext>,
    ) -> DeliveryOutcome {
        let correlation_id = correlation.and_then(|c| c.correlation_id.as_deref());

        let result = match rb_common::decode(body) {
            Ok(envelope) => self.dispatcher.dispatch(queue, &envelope).await,
            Err(e) => Err(e),
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    queue = %queue,
                    kind = e.kind().as_str(),
                    correlation_id = ?correlation_id,
                    error = %e,
                    "Dropping message without reply"
                );
                self.dead_letter(queue, body, &e).await;
                return DeliveryOutcome::Rejected(e.kind());
            }
        };

        let Some(context) = correlation else {
            warn!(queue = %queue, "Message processed but has no reply_to, reply discarded");
            return DeliveryOutcome::NoReplyAddress;
        };

        let body = match rb_common::encode(&reply) {
            Ok(body) => body,
            Err(e) => {
                error!(queue = %queue, correlation_id = ?correlation_id, error = %e, "Failed to encode reply");
                return DeliveryOutcome::ReplyFailed;
            }
        };

        match self.publisher.publish_reply(context, body).await {
            Ok(()) => {
                debug!(
                    queue = %queue,
                    reply_to = %context.reply_to,
                    correlation_id = ?correlation_id,
                    "Reply published"
                );
                DeliveryOutcome::Replied
            }
            Err(e) => {
                error!(
                    queue = %queue,
                    reply_to = %context.reply_to,
                    correlation_id = ?correlation_id,
                    error = %e,
                    "Failed to publish reply"
                );
                DeliveryOutcome::ReplyFailed
            }
        }
    }

    async fn dead_letter(&self, queue: &str, body: &[u8], error: &BridgeError) {
        let Some(exchange) = &self.dead_letter_exchange else {
            return;
        };
        if let Err(e) = self
            .publisher
            .publish_dead_letter(exchange, queue, body, error)
            .await
        {
            error!(queue = %queue, exchange = %exchange, error = %e, "Failed to dead-letter message");
        }
    }
}

// ============================================================================
// Queue Consumer
// ============================================================================

/// Why the consumption loop returned without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    Shutdown,
}

/// Owns the consumer channel; every consume, publish and ack happens through it
/// from the task running [`QueueConsumer::consume`].
pub struct QueueConsumer {
    channel: Channel,
    registrations: Vec<QueueRegistration>,
    handler: MessageHandler,
    config: ConsumerConfig,
}

impl QueueConsumer {
    pub fn new(
        channel: Channel,
        registrations: Vec<QueueRegistration>,
        dispatcher: Arc<Dispatcher>,
        config: ConsumerConfig,
    ) -> Self {
        let publisher = Arc::new(ChannelPublisher::new(channel.clone()));
        let handler = MessageHandler::new(dispatcher, publisher)
            .with_dead_letter_exchange(config.dead_letter_exchange.clone());

        Self {
            channel,
            registrations,
            handler,
            config,
        }
    }

    /// Apply prefetch and declare every registered queue before consuming
    pub async fn declare_queues(&self) -> Result<()> {
        self.channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        for registration in &self.registrations {
            self.channel
                .queue_declare(
                    &registration.name,
                    QueueDeclareOptions {
                        durable: registration.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            info!(
                queue = %registration.name,
                durable = registration.durable,
                operation = registration.operation.as_str(),
                "Declared queue"
            );
        }
        Ok(())
    }

    /// Start a consumer on every registered queue and merge them into one stream
    pub async fn subscribe(&self) -> Result<DeliveryStream> {
        let mut queues = Vec::with_capacity(self.registrations.len());
        for registration in &self.registrations {
            let tag = format!("{}-{}", self.config.consumer_tag_prefix, registration.name);
            let consumer = self
                .channel
                .basic_consume(
                    &registration.name,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            let queue = registration.name.clone();
            let deliveries = consumer.map(move |delivery| {
                delivery
                    .map(|d| InboundDelivery::from_lapin(queue.clone(), d))
                    .map_err(QueueError::Broker)
            });
            queues.push((registration.name.clone(), deliveries));
        }

        info!(queues = queues.len(), "Consuming");
        Ok(merge_queues(queues))
    }

    pub async fn consume<S>(
        &self,
        deliveries: S,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<ConsumerExit>
    where
        S: Stream<Item = (String, Result<InboundDelivery>)> + Unpin,
    {
        consume(&self.handler, deliveries, shutdown).await
    }
}

/// Deliveries from every queue, each tagged with the queue it arrived on
pub type DeliveryStream = BoxStream<'static, (String, Result<InboundDelivery>)>;

pub fn merge_queues<S>(queues: Vec<(String, S)>) -> DeliveryStream
where
    S: Stream<Item = Result<InboundDelivery>> + Send + 'static,
{
    let streams = queues.into_iter().map(|(queue, deliveries)| {
        deliveries
            .map(move |delivery| (queue.clone(), delivery))
            .boxed()
    });
    stream::select_all(streams).boxed()
}

/// Handle deliveries one at a time, in receipt order, until shutdown or stream failure.
///
/// Shutdown is observed between deliveries; a delivery being handled runs to completion.
pub async fn consume<S>(
    handler: &MessageHandler,
    mut deliveries: S,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<ConsumerExit>
where
    S: Stream<Item = (String, Result<InboundDelivery>)> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("Consumer shutting down");
                return Ok(ConsumerExit::Shutdown);
            }
            next = deliveries.next() => match next {
                Some((_, Ok(delivery))) => {
                    handler.handle(delivery).await;
                }
                Some((queue, Err(e))) => {
                    error!(queue = %queue, error = %e, "Consumer stream failed");
                    return Err(e);
                }
                None => {
                    warn!("All consumer streams ended");
                    return Err(QueueError::ConnectionClosed);
                }
            }
        }
    }
}
