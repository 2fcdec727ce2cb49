use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

pub mod codec;

pub use codec::{decode, encode, parse_object};

/// Queue serviced by the addition handler
pub const MATH_QUEUE: &str = "math_queue";

/// Queue serviced by the human detection handler
pub const IMAGE_QUEUE: &str = "image_queue";

// ============================================================================
// Core Message Types
// ============================================================================

/// Inbound request wrapper carried in the body of a queue message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Logical operation tag set by the caller (not enforced against the queue name)
    pub pattern: String,
    /// A non-object `data` on the wire decodes to an empty map, so the
    /// operation's required-field check reports it as missing fields
    pub data: Map<String, Value>,
}

impl Envelope {
    pub fn new(pattern: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            pattern: pattern.into(),
            data,
        }
    }
}

/// Reply published back to the caller, either a single result or a list of items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyEnvelope {
    Single { result: Value },
    Multi { results: Vec<ResultItem> },
}

impl ReplyEnvelope {
    pub fn single(result: Value) -> Self {
        ReplyEnvelope::Single { result }
    }

    pub fn multi(results: Vec<ResultItem>) -> Self {
        ReplyEnvelope::Multi { results }
    }
}

/// Detection verdict, encoded on the wire as one of two literal tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HumanDetection {
    HumanDetected,
    NoHumanDetected,
}

impl HumanDetection {
    pub fn as_str(&self) -> &'static str {
        match self {
            HumanDetection::HumanDetected => "human_detected",
            HumanDetection::NoHumanDetected => "no_human_detected",
        }
    }
}

impl From<bool> for HumanDetection {
    fn from(detected: bool) -> Self {
        if detected {
            HumanDetection::HumanDetected
        } else {
            HumanDetection::NoHumanDetected
        }
    }
}

/// Per-image entry of a detection reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ResultItem {
    pub url: String,
    pub human_detected: HumanDetection,
}

impl ResultItem {
    pub fn new(url: impl Into<String>, human_detected: HumanDetection) -> Self {
        Self {
            url: url.into(),
            human_detected,
        }
    }
}

/// Reply addressing taken from the broker message properties, never from the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext {
    pub reply_to: String,
    /// Echoed verbatim on the reply, including its absence
    pub correlation_id: Option<String>,
}

impl CorrelationContext {
    /// Build a context from raw message properties.
    ///
    /// Returns `None` when the message carries no usable reply destination.
    pub fn from_properties(reply_to: Option<&str>, correlation_id: Option<&str>) -> Option<Self> {
        let reply_to = reply_to.filter(|r| !r.is_empty())?;
        Some(Self {
            reply_to: reply_to.to_string(),
            correlation_id: correlation_id.map(str::to_string),
        })
    }
}

// ============================================================================
// Queue Registration
// ============================================================================

/// Logical operation a queue is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Add,
    CheckHuman,
}

/// Which transport a request arrived on; only affects error wording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    Queue,
    Http,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::CheckHuman => "check_human",
        }
    }

    /// Fields that must be present in `data` before the worker is invoked
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Operation::Add => &["x", "y"],
            Operation::CheckHuman => &["media"],
        }
    }

    pub fn missing_fields_message(&self, source: RequestSource) -> String {
        let place = match source {
            RequestSource::Queue => "received data",
            RequestSource::Http => "request",
        };
        match self {
            Operation::Add => format!("Missing 'x' or 'y' in the {}", place),
            Operation::CheckHuman => format!("Missing 'media' in the {}", place),
        }
    }
}

/// A queue declared at startup together with the operation that handles it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRegistration {
    pub name: String,
    #[serde(default = "default_durable")]
    pub durable: bool,
    pub operation: Operation,
}

fn default_durable() -> bool {
    true
}

impl QueueRegistration {
    pub fn durable(name: impl Into<String>, operation: Operation) -> Self {
        Self {
            name: name.into(),
            durable: true,
            operation,
        }
    }
}

/// The two queues served out of the box
pub fn default_registrations() -> Vec<QueueRegistration> {
    vec![
        QueueRegistration::durable(MATH_QUEUE, Operation::Add),
        QueueRegistration::durable(IMAGE_QUEUE, Operation::CheckHuman),
    ]
}

/// JSON type name used in worker error messages
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Failure raised by a worker function
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("unsupported operand type(s) for +: '{left}' and '{right}'")]
    NonNumeric { left: String, right: String },

    #[error("integer overflow in addition")]
    Overflow,

    #[error("{0}")]
    InvalidInput(String),

    #[error("Detector unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid detector response: {0}")]
    InvalidResponse(String),
}

/// Per-request failure; contained at the dispatcher/consumer boundary
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Invalid JSON received: {0}")]
    MalformedPayload(String),

    #[error("{message}")]
    SchemaViolation { message: String },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("No handler registered for queue '{0}'")]
    UnknownQueue(String),
}

/// Stable label for logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedPayload,
    SchemaViolation,
    WorkerError,
    UnknownQueue,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedPayload => "malformed_payload",
            ErrorKind::SchemaViolation => "schema_violation",
            ErrorKind::WorkerError => "worker_error",
            ErrorKind::UnknownQueue => "unknown_queue",
        }
    }
}

impl BridgeError {
    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::MalformedPayload(_) => ErrorKind::MalformedPayload,
            BridgeError::SchemaViolation { .. } => ErrorKind::SchemaViolation,
            BridgeError::Worker(_) => ErrorKind::WorkerError,
            BridgeError::UnknownQueue(_) => ErrorKind::UnknownQueue,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_message_per_transport() {
        assert_eq!(
            Operation::Add.missing_fields_message(RequestSource::Http),
            "Missing 'x' or 'y' in the request"
        );
        assert_eq!(
            Operation::Add.missing_fields_message(RequestSource::Queue),
            "Missing 'x' or 'y' in the received data"
        );
        assert_eq!(
            Operation::CheckHuman.missing_fields_message(RequestSource::Http),
            "Missing 'media' in the request"
        );
    }

    #[test]
    fn test_correlation_context_requires_reply_to() {
        assert!(CorrelationContext::from_properties(None, Some("abc")).is_none());
        assert!(CorrelationContext::from_properties(Some(""), Some("abc")).is_none());

        let ctx = CorrelationContext::from_properties(Some("amq.gen-1"), None).unwrap();
        assert_eq!(ctx.reply_to, "amq.gen-1");
        assert_eq!(ctx.correlation_id, None);
    }

    #[test]
    fn test_default_registrations_are_durable() {
        let regs = default_registrations();
        assert_eq!(regs.len(), 2);
        assert!(regs.iter().all(|r| r.durable));
        assert_eq!(regs[0].operation, Operation::Add);
        assert_eq!(regs[1].name, IMAGE_QUEUE);
    }

    #[test]
    fn test_error_kind_labels() {
        let err = BridgeError::from(WorkerError::Overflow);
        assert_eq!(err.kind(), ErrorKind::WorkerError);
        assert_eq!(err.kind().as_str(), "worker_error");
        assert_eq!(BridgeError::schema("x").kind(), ErrorKind::SchemaViolation);
    }

    #[test]
    fn test_human_detection_from_bool() {
        assert_eq!(HumanDetection::from(true).as_str(), "human_detected");
        assert_eq!(HumanDetection::from(false).as_str(), "no_human_detected");
    }
}
