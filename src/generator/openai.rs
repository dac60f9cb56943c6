//! OpenAI-compatible HTTP backend (OpenAI, vLLM, TGI and similar servers).

use super::{field_text, joined_prompt, Generator};
use crate::config::{DecodingMethod, GeneratorConfig};
use crate::types::{GenerationCall, GenerationOutput, Method, Request};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// Chunks (or chat requests) in flight at once.
const MAX_INFLIGHT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiMode {
    /// `/completions`: batched prompts; supports `loglikelihood` via echoed logprobs.
    Completions,
    /// `/chat/completions`: one user message per request; `generate` only.
    Chat,
}

pub struct OpenAiGenerator {
    config: GeneratorConfig,
    mode: OpenAiMode,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    text: String,
    #[serde(default)]
    logprobs: Option<CompletionLogprobs>,
}

#[derive(Debug, Deserialize)]
struct CompletionLogprobs {
    #[serde(default)]
    token_logprobs: Vec<Option<f64>>,
    #[serde(default)]
    text_offset: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiGenerator {
    pub fn from_config(config: &GeneratorConfig, mode: OpenAiMode) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(32)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            api_key: config.resolve_api_key(),
            config: config.clone(),
            mode,
            client,
            base_url,
        })
    }

    pub fn mode(&self) -> OpenAiMode {
        self.mode
    }

    fn temperature(&self) -> f64 {
        match self.config.decoding_method {
            DecodingMethod::Greedy => 0.0,
            DecodingMethod::Sample => self.config.temperature,
        }
    }

    /// Parameters shared by every generation request.
    fn sampling_params(&self) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("model".into(), json!(self.config.model_id_or_path));
        body.insert("max_tokens".into(), json!(self.config.max_new_tokens));
        body.insert("temperature".into(), json!(self.temperature()));
        if self.config.min_new_tokens > 0 {
            body.insert("min_tokens".into(), json!(self.config.min_new_tokens));
        }
        if let Some(seed) = self.config.seed {
            body.insert("seed".into(), json!(seed));
        }
        if !self.config.stop_sequences.is_empty() {
            body.insert("stop".into(), json!(self.config.stop_sequences));
        }
        body
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(512).collect();
            let msg = format!("HTTP {} from {}: {}", status.as_u16(), url, snippet);
            warn!(backend = %self.name(), status = status.as_u16(), "backend request failed");
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                Error::backend_retryable(self.name(), msg)
            } else {
                Error::backend(self.name(), msg)
            });
        }
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::backend(self.name(), format!("malformed response from {}: {}", url, e))
        })
    }

    /// Put choices back in prompt order using their `index`.
    fn ordered_choices(
        &self,
        choices: Vec<CompletionChoice>,
        expected: usize,
    ) -> Result<Vec<CompletionChoice>> {
        let mut slots: Vec<Option<CompletionChoice>> = (0..expected).map(|_| None).collect();
        for choice in choices {
            let idx = choice.index;
            match slots.get_mut(idx) {
                Some(slot) if slot.is_none() => *slot = Some(choice),
                _ => {
                    return Err(Error::backend(
                        self.name(),
                        format!("unexpected choice index {} for {} prompts", idx, expected),
                    ))
                }
            }
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                c.ok_or_else(|| Error::backend(self.name(), format!("no choice for prompt {}", i)))
            })
            .collect()
    }

    async fn complete_chunk(&self, prompts: Vec<String>) -> Result<Vec<GenerationOutput>> {
        let n = prompts.len();
        let mut body = self.sampling_params();
        body.insert("prompt".into(), json!(prompts));
        let resp: CompletionResponse = self.post("completions", &Value::Object(body)).await?;
        Ok(self
            .ordered_choices(resp.choices, n)?
            .into_iter()
            .map(|c| GenerationOutput::Text(c.text))
            .collect())
    }

    async fn score_chunk(&self, pairs: Vec<(String, String)>) -> Result<Vec<GenerationOutput>> {
        let n = pairs.len();
        let prompts: Vec<String> = pairs.iter().map(|(c, x)| format!("{}{}", c, x)).collect();
        let body = json!({
            "model": self.config.model_id_or_path,
            "prompt": prompts,
            "max_tokens": 0,
            "temperature": 0.0,
            "echo": true,
            "logprobs": 1,
        });
        let resp: CompletionResponse = self.post("completions", &body).await?;
        self.ordered_choices(resp.choices, n)?
            .into_iter()
            .zip(pairs.iter())
            .map(|(choice, (context, _))| {
                let logprobs = choice.logprobs.ok_or_else(|| {
                    Error::backend(self.name(), "response carries no logprobs for echoed prompt")
                })?;
                continuation_logprob(self.name(), &logprobs, context.chars().count())
                    .map(GenerationOutput::LogLikelihood)
            })
            .collect()
    }

    async fn chat_one(&self, prompt: String) -> Result<GenerationOutput> {
        let mut body = self.sampling_params();
        body.insert(
            "messages".into(),
            json!([{ "role": "user", "content": prompt }]),
        );
        let resp: ChatResponse = self.post("chat/completions", &Value::Object(body)).await?;
        let content = resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::backend(self.name(), "chat response has no content"))?;
        Ok(GenerationOutput::Text(content))
    }

    async fn generate_outputs(
        &self,
        batch: &[Request],
        call: &GenerationCall,
    ) -> Result<Vec<GenerationOutput>> {
        let chunk = self.config.batch_size.max(1);
        match (self.mode, call.method()) {
            (OpenAiMode::Completions, Method::Generate) => {
                let prompts = batch
                    .iter()
                    .map(|r| joined_prompt(self.name(), r, call))
                    .collect::<Result<Vec<_>>>()?;
                let chunks: Vec<Vec<String>> = prompts.chunks(chunk).map(|c| c.to_vec()).collect();
                let outputs: Vec<Vec<GenerationOutput>> = futures::stream::iter(chunks)
                    .map(|c| self.complete_chunk(c))
                    .buffered(MAX_INFLIGHT)
                    .try_collect()
                    .await?;
                Ok(outputs.into_iter().flatten().collect())
            }
            (OpenAiMode::Completions, Method::LogLikelihood) => {
                let fields = call.field_names();
                let pairs = batch
                    .iter()
                    .map(|r| -> Result<(String, String)> {
                        Ok((
                            field_text(self.name(), r, &fields[0])?,
                            field_text(self.name(), r, &fields[1])?,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let chunks: Vec<Vec<(String, String)>> =
                    pairs.chunks(chunk).map(|c| c.to_vec()).collect();
                let outputs: Vec<Vec<GenerationOutput>> = futures::stream::iter(chunks)
                    .map(|c| self.score_chunk(c))
                    .buffered(MAX_INFLIGHT)
                    .try_collect()
                    .await?;
                Ok(outputs.into_iter().flatten().collect())
            }
            (OpenAiMode::Chat, Method::Generate) => {
                let prompts = batch
                    .iter()
                    .map(|r| joined_prompt(self.name(), r, call))
                    .collect::<Result<Vec<_>>>()?;
                futures::stream::iter(prompts)
                    .map(|p| self.chat_one(p))
                    .buffered(chunk)
                    .try_collect()
                    .await
            }
            (OpenAiMode::Chat, Method::LogLikelihood) => Err(Error::backend(
                self.name(),
                "loglikelihood is not supported by chat endpoints",
            )),
        }
    }
}

/// Sum of logprobs for tokens starting at or after the end of the context.
fn continuation_logprob(
    backend: &str,
    logprobs: &CompletionLogprobs,
    context_chars: usize,
) -> Result<f64> {
    if logprobs.token_logprobs.len() != logprobs.text_offset.len() {
        return Err(Error::backend(
            backend,
            "token_logprobs and text_offset lengths differ",
        ));
    }
    let mut total = 0.0;
    for (offset, lp) in logprobs.text_offset.iter().zip(&logprobs.token_logprobs) {
        if *offset < context_chars {
            continue;
        }
        match lp {
            Some(v) => total += v,
            None => {
                return Err(Error::backend(
                    backend,
                    format!("missing logprob for continuation token at offset {}", offset),
                ))
            }
        }
    }
    Ok(total)
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn name(&self) -> &str {
        self.config.name.as_deref().unwrap_or(match self.mode {
            OpenAiMode::Completions => "openai",
            OpenAiMode::Chat => "openai-chat",
        })
    }

    fn fingerprint_source(&self) -> Value {
        let mut source = self.config.fingerprint_source();
        if let Value::Object(ref mut map) = source {
            let endpoint = match self.mode {
                OpenAiMode::Completions => "completions",
                OpenAiMode::Chat => "chat",
            };
            map.insert("endpoint".into(), json!(endpoint));
        }
        source
    }

    async fn generate_batch(&self, batch: &mut [Request], call: &GenerationCall) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        debug!(
            backend = %self.name(),
            method = %call.method(),
            items = batch.len(),
            "dispatching batch"
        );
        let outputs = self.generate_outputs(batch, call).await?;
        if outputs.len() != batch.len() {
            return Err(Error::backend(
                self.name(),
                format!("{} outputs for {} requests", outputs.len(), batch.len()),
            ));
        }
        for (req, output) in batch.iter_mut().zip(outputs) {
            req.set_result(call.result_slot(), output);
        }
        Ok(())
    }
}
