//! # Generator Module
//!
//! The batched generation contract every backend implements, plus the
//! built-in backends.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Generator`] | Batched generation trait |
//! | [`EchoGenerator`] | Deterministic offline backend for dry runs and tests |
//! | [`OpenAiGenerator`] | OpenAI-compatible HTTP backend (completions or chat) |

mod echo;
mod openai;

pub use echo::EchoGenerator;
pub use openai::{OpenAiGenerator, OpenAiMode};

use crate::types::{GenerationCall, Request};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;

/// A backend that fills one result slot on every request of a batch.
///
/// Implementations must write `call.result_slot()` on each request, leave the
/// slice order untouched, and report failure for the batch as a whole. The
/// field count of `call` already fits its method.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    /// Everything in this backend's configuration that can change its output
    /// for identical inputs. Credentials, endpoints and batching knobs stay out.
    fn fingerprint_source(&self) -> serde_json::Value;

    async fn generate_batch(&self, batch: &mut [Request], call: &GenerationCall) -> Result<()>;
}

/// Text of one input field as a backend sees it: strings verbatim, any other
/// JSON value in its compact serialized form.
pub(crate) fn field_text(backend: &str, req: &Request, name: &str) -> Result<String> {
    match req.field(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(Error::backend(
            backend,
            format!("request {} has no field '{}'", req.id(), name),
        )),
    }
}

/// Selected fields joined by newlines, the prompt for free-text generation.
pub(crate) fn joined_prompt(backend: &str, req: &Request, call: &GenerationCall) -> Result<String> {
    Ok(call
        .field_names()
        .iter()
        .map(|f| field_text(backend, req, f))
        .collect::<Result<Vec<_>>>()?
        .join("\n"))
}
