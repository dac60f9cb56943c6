//! Requests, batches and generation outputs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Ordered collection of requests. Position is significant end to end.
pub type RequestBatch = Vec<Request>;

/// Output of a single work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationOutput {
    /// Free-text completion
    Text(String),
    /// Log-likelihood of a continuation given its context
    LogLikelihood(f64),
}

impl GenerationOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            GenerationOutput::Text(t) => Some(t),
            GenerationOutput::LogLikelihood(_) => None,
        }
    }

    pub fn as_loglikelihood(&self) -> Option<f64> {
        match self {
            GenerationOutput::LogLikelihood(v) => Some(*v),
            GenerationOutput::Text(_) => None,
        }
    }

    /// Plain JSON form used when a request is flattened back into a record.
    pub fn to_value(&self) -> Value {
        match self {
            GenerationOutput::Text(t) => Value::String(t.clone()),
            GenerationOutput::LogLikelihood(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }
}

/// A unit of work: input fields plus named result slots.
///
/// Result slots live in their own namespace, so a slot called `prompt` never
/// overwrites an input field called `prompt`. The `id` is assigned once and is
/// carried unchanged through every generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    id: Uuid,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    results: BTreeMap<String, GenerationOutput>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            fields: Map::new(),
            results: BTreeMap::new(),
        }
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            ..Self::new()
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn result(&self, slot: &str) -> Option<&GenerationOutput> {
        self.results.get(slot)
    }

    pub fn set_result(&mut self, slot: impl Into<String>, output: GenerationOutput) {
        self.results.insert(slot.into(), output);
    }

    pub fn results(&self) -> &BTreeMap<String, GenerationOutput> {
        &self.results
    }

    /// Copy of this request with the same id and fields but no results, as
    /// handed to a backend.
    pub fn detached(&self) -> Self {
        Self {
            id: self.id,
            fields: self.fields.clone(),
            results: BTreeMap::new(),
        }
    }

    /// Flatten into a single JSON object: input fields first, then each result
    /// slot under its own name.
    pub fn to_record(&self) -> Map<String, Value> {
        let mut record = self.fields.clone();
        for (slot, output) in &self.results {
            record.insert(slot.clone(), output.to_value());
        }
        record
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Map<String, Value>> for Request {
    fn from(fields: Map<String, Value>) -> Self {
        Self::from_fields(fields)
    }
}
