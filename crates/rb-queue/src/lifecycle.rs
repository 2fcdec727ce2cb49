//! Service Runtime - connection lifecycle for the queue side
//!
//! Idle -> Connecting -> QueuesDeclared -> Running -> ShuttingDown -> Stopped
//!
//! A broker failure while Running goes back to Connecting; if the reconnect
//! budget runs out the runtime ends in Stopped with the error.

use std::sync::Arc;

use rb_common::QueueRegistration;
use rb_config::{BrokerConfig, ConsumerConfig, ReconnectConfig, ServiceConfig};
use rb_dispatch::Dispatcher;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::BrokerSession;
use crate::consumer::{ConsumerExit, QueueConsumer};
use crate::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Connecting,
    QueuesDeclared,
    Running,
    ShuttingDown,
    Stopped,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Idle => "IDLE",
            RuntimeState::Connecting => "CONNECTING",
            RuntimeState::QueuesDeclared => "QUEUES_DECLARED",
            RuntimeState::Running => "RUNNING",
            RuntimeState::ShuttingDown => "SHUTTING_DOWN",
            RuntimeState::Stopped => "STOPPED",
        }
    }

    /// Only a consuming runtime reports ready
    pub fn is_ready(&self) -> bool {
        matches!(self, RuntimeState::Running)
    }
}

pub struct ServiceRuntime {
    broker: BrokerConfig,
    reconnect: ReconnectConfig,
    consumer: ConsumerConfig,
    registrations: Vec<QueueRegistration>,
    dispatcher: Arc<Dispatcher>,
    state_tx: watch::Sender<RuntimeState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServiceRuntime {
    pub fn new(config: &ServiceConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let (state_tx, _) = watch::channel(RuntimeState::Idle);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            broker: config.broker.clone(),
            reconnect: config.reconnect.clone(),
            consumer: config.consumer.clone(),
            registrations: config.queues.clone(),
            dispatcher,
            state_tx,
            shutdown_tx,
        }
    }

    pub fn state(&self) -> RuntimeState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RuntimeState> {
        self.state_tx.subscribe()
    }

    /// Stopped is final, and once shutdown has begun the only way out is Stopped
    fn set_state(&self, next: RuntimeState) {
        self.state_tx.send_if_modified(|state| {
            let previous = *state;
            if previous == next
                || previous == RuntimeState::Stopped
                || (previous == RuntimeState::ShuttingDown && next != RuntimeState::Stopped)
            {
                return false;
            }
            *state = next;
            info!(from = previous.as_str(), to = next.as_str(), "Runtime state changed");
            true
        });
    }

    /// Connect, declare queues and spawn the consumption loop.
    ///
    /// Fails without spawning anything if the broker cannot be reached within
    /// the reconnect budget or a queue declaration is rejected.
    pub async fn start(self: Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        if matches!(self.state(), RuntimeState::ShuttingDown | RuntimeState::Stopped) {
            return Err(QueueError::ShutdownInProgress);
        }
        let shutdown_rx = self.shutdown_tx.subscribe();

        let (session, consumer) = match self.establish().await {
            Ok(established) => established,
            Err(e) => {
                self.set_state(RuntimeState::Stopped);
                return Err(e);
            }
        };

        let runtime = self.clone();
        Ok(tokio::spawn(async move {
            runtime.run(session, consumer, shutdown_rx).await
        }))
    }

    /// Stop consuming after the delivery in progress, then close the connection
    pub fn shutdown(&self) {
        self.set_state(RuntimeState::ShuttingDown);
        let _ = self.shutdown_tx.send(());
    }

    async fn establish(&self) -> Result<(BrokerSession, QueueConsumer)> {
        self.set_state(RuntimeState::Connecting);

        let session = BrokerSession::connect(&self.broker, &self.reconnect).await?;
        let channel = session.open_channel().await?;
        let consumer = QueueConsumer::new(
            channel,
            self.registrations.clone(),
            self.dispatcher.clone(),
            self.consumer.clone(),
        );

        if let Err(e) = consumer.declare_queues().await {
            session.close().await;
            return Err(e);
        }

        self.set_state(RuntimeState::QueuesDeclared);
        Ok((session, consumer))
    }

    async fn run(
        &self,
        mut session: BrokerSession,
        mut consumer: QueueConsumer,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            if self.state() == RuntimeState::ShuttingDown {
                session.close().await;
                break;
            }

            let exit = match consumer.subscribe().await {
                Ok(deliveries) => {
                    self.set_state(RuntimeState::Running);
                    consumer.consume(deliveries, &mut shutdown_rx).await
                }
                Err(e) => Err(e),
            };
            session.close().await;

            match exit {
                Ok(ConsumerExit::Shutdown) => break,
                Err(_) if self.state() == RuntimeState::ShuttingDown => break,
                Err(e) => {
                    error!(error = %e, "Lost broker connection, reconnecting");
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        established = self.establish() => match established {
                            Ok((s, c)) => {
                                session = s;
                                consumer = c;
                            }
                            Err(e) => {
                                error!(error = %e, "Reconnect failed, consumer stopped");
                                self.set_state(RuntimeState::Stopped);
                                return Err(e);
                            }
                        }
                    }
                }
            }
        }

        self.set_state(RuntimeState::Stopped);
        info!("Consumer runtime stopped");
        Ok(())
    }
}
