//! Queue RPC bridge - broker side
//!
//! This crate provides the AMQP plumbing around the dispatcher:
//! - BrokerSession: connection establishment with bounded backoff
//! - QueueConsumer: durable queue declaration and the single consumption loop
//! - MessageHandler: per-delivery protocol (dispatch, reply, ack exactly once)
//! - RpcClient: caller side, correlating replies to waiting requests
//! - GatewayClient: RpcClient on its own connection, rebuilt after broker failures
//! - ServiceRuntime: connection lifecycle state machine and shutdown

pub mod broker;
pub mod consumer;
pub mod lifecycle;
pub mod rpc_client;

use std::time::Duration;

use rb_common::BridgeError;

pub use broker::BrokerSession;
pub use consumer::{
    consume, merge_queues, Acknowledge, ChannelPublisher, ConsumerExit, DeliveryOutcome,
    DeliveryStream, InboundDelivery, MessageHandler, QueueConsumer, ReplyPublisher,
};
pub use lifecycle::{RuntimeState, ServiceRuntime};
pub use rpc_client::{GatewayClient, PendingReplies, RpcCaller, RpcClient};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Broker connection closed")]
    ConnectionClosed,

    #[error("Gave up connecting to broker after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("No reply received within {0:?}")]
    RpcTimeout(Duration),

    #[error("Invalid reply: {0}")]
    InvalidReply(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, QueueError>;
