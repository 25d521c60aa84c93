//! The value a stage function returns.

use serde::{Deserialize, Serialize};

/// The output of a successful stage execution.
///
/// The payload is opaque to the core: it is persisted as-is and folded into
/// the next [`StageContext`](crate::context::StageContext) under the stage's
/// name. The provenance tag is recorded on the cache version (typically the
/// external model that produced the payload).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage output.
    pub payload: serde_json::Value,
    /// Free-form provenance tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl StageResult {
    /// Creates a result with the given payload.
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            provenance: None,
        }
    }

    /// Creates a result whose payload is a plain string.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(serde_json::Value::String(text.into()))
    }

    /// Serializes a typed value into a result.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    /// Sets the provenance tag.
    #[must_use]
    pub fn with_provenance(mut self, provenance: impl Into<String>) -> Self {
        self.provenance = Some(provenance.into());
        self
    }
}

impl From<serde_json::Value> for StageResult {
    fn from(payload: serde_json::Value) -> Self {
        Self::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_result() {
        let result = StageResult::text("hello").with_provenance("whisper-large-v3");
        assert_eq!(result.payload, json!("hello"));
        assert_eq!(result.provenance.as_deref(), Some("whisper-large-v3"));
    }

    #[test]
    fn test_from_serialize() {
        #[derive(Serialize)]
        struct Summary {
            bullets: Vec<&'static str>,
        }

        let result = StageResult::from_serialize(&Summary {
            bullets: vec!["one", "two"],
        })
        .unwrap();
        assert_eq!(result.payload, json!({"bullets": ["one", "two"]}));
        assert!(result.provenance.is_none());
    }
}
