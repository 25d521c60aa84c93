//! Run-scoped metadata carried alongside stage outputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifies a run and carries the small bag of values every stage may read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    /// The run identifier; also the cache namespace.
    pub run_id: String,

    /// Content classification (e.g. "lecture", "interview").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,

    /// Size of the source recording, in the unit the cost model expects
    /// (seconds of audio by convention).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_size: Option<f64>,

    /// Free-form attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl RunMetadata {
    /// Creates metadata for the given run id.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            classification: None,
            input_size: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Creates metadata with a freshly generated, time-ordered run id.
    #[must_use]
    pub fn generated() -> Self {
        Self::new(Uuid::now_v7().to_string())
    }

    /// Sets the content classification.
    #[must_use]
    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = Some(classification.into());
        self
    }

    /// Sets the input size metric.
    #[must_use]
    pub fn with_input_size(mut self, size: f64) -> Self {
        self.input_size = Some(size);
        self
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Gets an attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }
}
