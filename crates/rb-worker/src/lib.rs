//! Worker functions
//!
//! The bridge treats these as external collaborators:
//! - `add_numbers`: numeric addition over JSON values
//! - `HumanDetector`: pluggable person detection for an image URL

mod detector;

pub use detector::{HttpDetectorConfig, HttpHumanDetector};

use async_trait::async_trait;
use rb_common::{json_type_name, WorkerError};
use serde_json::{Number, Value};

/// Decides whether the image behind `url` contains a person
#[async_trait]
pub trait HumanDetector: Send + Sync {
    async fn detect(&self, url: &str) -> Result<bool, WorkerError>;
}

/// Add two JSON numbers.
///
/// Two integers stay integral (`2 + 3 == 5`); any float operand produces a float.
pub fn add_numbers(x: &Value, y: &Value) -> Result<Value, WorkerError> {
    let (Value::Number(a), Value::Number(b)) = (x, y) else {
        return Err(WorkerError::NonNumeric {
            left: json_type_name(x).to_string(),
            right: json_type_name(y).to_string(),
        });
    };

    if let (Some(a), Some(b)) = (integer(a), integer(b)) {
        // Both operands fit in 65 bits, so the i128 sum is exact
        let sum = a + b;
        if let Ok(sum) = i64::try_from(sum) {
            return Ok(Value::from(sum));
        }
        return u64::try_from(sum)
            .map(Value::from)
            .map_err(|_| WorkerError::Overflow);
    }

    let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
        return Err(WorkerError::InvalidInput("operands are not representable as numbers".to_string()));
    };
    Number::from_f64(a + b)
        .map(Value::Number)
        .ok_or_else(|| WorkerError::InvalidInput("sum is not a finite number".to_string()))
}

fn integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}
