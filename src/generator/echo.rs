//! Deterministic offline backend.

use super::{field_text, joined_prompt, Generator};
use crate::config::GeneratorConfig;
use crate::types::{GenerationCall, GenerationOutput, Method, Request};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Produces outputs from the inputs alone, without a model.
///
/// `generate` joins the selected field values with newlines and keeps the
/// first `max_new_tokens` whitespace-separated tokens. `loglikelihood` scores
/// the continuation as `-len(continuation) / (1 + len(context))` in chars.
pub struct EchoGenerator {
    config: GeneratorConfig,
}

impl EchoGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.clone()))
    }

    fn run_one(&self, req: &Request, call: &GenerationCall) -> Result<GenerationOutput> {
        match call.method() {
            Method::Generate => {
                let text = joined_prompt(self.name(), req, call)?
                    .split_whitespace()
                    .take(self.config.max_new_tokens as usize)
                    .collect::<Vec<_>>()
                    .join(" ");
                Ok(GenerationOutput::Text(text))
            }
            Method::LogLikelihood => {
                let fields = call.field_names();
                let context = field_text(self.name(), req, &fields[0])?;
                let continuation = field_text(self.name(), req, &fields[1])?;
                let score =
                    -(continuation.chars().count() as f64) / (1.0 + context.chars().count() as f64);
                Ok(GenerationOutput::LogLikelihood(score))
            }
        }
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    fn name(&self) -> &str {
        self.config.name.as_deref().unwrap_or("echo")
    }

    fn fingerprint_source(&self) -> Value {
        self.config.fingerprint_source()
    }

    async fn generate_batch(&self, batch: &mut [Request], call: &GenerationCall) -> Result<()> {
        for req in batch.iter_mut() {
            let output = self.run_one(req, call)?;
            req.set_result(call.result_slot(), output);
        }
        Ok(())
    }
}
