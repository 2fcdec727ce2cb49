//! Dispatcher - routes validated requests to worker functions
//!
//! Shared by both transports:
//! - the queue consumer calls [`Dispatcher::dispatch`] with the queue name
//! - the HTTP adapter calls [`Dispatcher::execute`] with the operation directly

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rb_common::{
    BridgeError, Envelope, Operation, QueueRegistration, ReplyEnvelope, RequestSource, Result,
    ResultItem, HumanDetection,
};
use rb_worker::{add_numbers, HumanDetector};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::schema::{image_urls, require_fields};

pub struct Dispatcher {
    /// Queue name to operation, fixed once the runtime starts
    routes: HashMap<String, Operation>,
    detector: Arc<dyn HumanDetector>,
}

impl Dispatcher {
    pub fn new(detector: Arc<dyn HumanDetector>) -> Self {
        Self {
            routes: HashMap::new(),
            detector,
        }
    }

    pub fn with_registrations(
        detector: Arc<dyn HumanDetector>,
        registrations: &[QueueRegistration],
    ) -> Self {
        let mut dispatcher = Self::new(detector);
        for registration in registrations {
            dispatcher.register(registration.name.clone(), registration.operation);
        }
        dispatcher
    }

    pub fn register(&mut self, queue: impl Into<String>, operation: Operation) {
        self.routes.insert(queue.into(), operation);
    }

    pub fn operation_for(&self, queue: &str) -> Option<Operation> {
        self.routes.get(queue).copied()
    }

    /// Handle an envelope that arrived on `queue`
    pub async fn dispatch(&self, queue: &str, envelope: &Envelope) -> Result<ReplyEnvelope> {
        let operation = self
            .operation_for(queue)
            .ok_or_else(|| BridgeError::UnknownQueue(queue.to_string()))?;

        debug!(
            queue = %queue,
            pattern = %envelope.pattern,
            operation = operation.as_str(),
            "Dispatching envelope"
        );

        self.execute(operation, &envelope.data, RequestSource::Queue).await
    }

    /// Validate `data` for `operation` and invoke the worker
    pub async fn execute(
        &self,
        operation: Operation,
        data: &Map<String, Value>,
        source: RequestSource,
    ) -> Result<ReplyEnvelope> {
        require_fields(operation, data, source)?;

        let started = Instant::now();
        let reply = match operation {
            Operation::Add => self.add(data),
            Operation::CheckHuman => self.check_human(data).await,
        };

        metrics::histogram!("rb_dispatch_duration_seconds", "operation" => operation.as_str())
            .record(started.elapsed().as_secs_f64());

        reply
    }

    fn add(&self, data: &Map<String, Value>) -> Result<ReplyEnvelope> {
        let (x, y) = (&data["x"], &data["y"]);
        let result = add_numbers(x, y)?;
        info!(x = %x, y = %y, result = %result, "Computed sum");
        Ok(ReplyEnvelope::single(result))
    }

    async fn check_human(&self, data: &Map<String, Value>) -> Result<ReplyEnvelope> {
        let urls = image_urls(&data["media"])?;

        let mut results = Vec::with_capacity(urls.len());
        for url in urls {
            let detection = HumanDetection::from(self.detector.detect(url).await?);
            debug!(url = %url, detection = detection.as_str(), "Image checked");
            results.push(ResultItem::new(url, detection));
        }

        info!(images = results.len(), "Completed human detection");
        Ok(ReplyEnvelope::multi(results))
    }
}
