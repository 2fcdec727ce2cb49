//! Required-field validation and media item extraction

use rb_common::{BridgeError, Operation, RequestSource, Result, WorkerError};
use serde_json::{Map, Value};

/// Fail with a `SchemaViolation` if any field required by `operation` is absent
pub fn require_fields(
    operation: Operation,
    data: &Map<String, Value>,
    source: RequestSource,
) -> Result<()> {
    let missing = operation
        .required_fields()
        .iter()
        .any(|field| !data.contains_key(*field));

    if missing {
        return Err(BridgeError::schema(operation.missing_fields_message(source)));
    }
    Ok(())
}

/// URLs of the `type == "image"` entries in a media list, in input order.
///
/// Entries of any other type, or lacking a string `url`/`type`, are skipped.
pub fn image_urls(media: &Value) -> Result<Vec<&str>> {
    let items = media.as_array().ok_or_else(|| {
        WorkerError::InvalidInput("'media' must be a list".to_string())
    })?;

    Ok(items
        .iter()
        .filter_map(|item| {
            let item = item.as_object()?;
            let kind = item.get("type")?.as_str()?;
            let url = item.get("url")?.as_str()?;
            (kind == "image").then_some(url)
        })
        .collect())
}
