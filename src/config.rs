//! Configuration structures.
//!
//! A YAML file with a `generator` section (which backend, which model, which
//! decoding parameters) and a `cache` section (where the store lives).
//! String values may reference environment variables as `${VAR}`.

use crate::cache::{CacheStore, MemoryStore, NullStore, SqliteStore};
use crate::{Error, ErrorContext, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodingMethod {
    #[default]
    Greedy,
    Sample,
}

/// Backend configuration. `type` selects the constructor in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    pub model_id_or_path: String,
    #[serde(default)]
    pub decoding_method: DecodingMethod,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default)]
    pub min_new_tokens: u32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_temperature() -> f64 {
    1.0
}

fn default_max_new_tokens() -> u32 {
    256
}

fn default_batch_size() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    120
}

impl GeneratorConfig {
    pub fn new(kind: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            model_id_or_path: model.into(),
            decoding_method: DecodingMethod::default(),
            temperature: default_temperature(),
            max_new_tokens: default_max_new_tokens(),
            min_new_tokens: 0,
            seed: None,
            stop_sequences: Vec::new(),
            base_url: None,
            api_key_env: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
    pub fn with_max_new_tokens(mut self, n: u32) -> Self {
        self.max_new_tokens = n;
        self
    }
    pub fn with_temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    /// Display name, falling back to `type:model`.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.kind, self.model_id_or_path))
    }

    /// Output-affecting subset of the configuration.
    pub fn fingerprint_source(&self) -> serde_json::Value {
        json!({
            "type": self.kind,
            "model": self.model_id_or_path,
            "decoding_method": self.decoding_method,
            "temperature": self.temperature,
            "max_new_tokens": self.max_new_tokens,
            "min_new_tokens": self.min_new_tokens,
            "seed": self.seed,
            "stop_sequences": self.stop_sequences,
        })
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: String| {
            Error::configuration_with_context(
                msg,
                ErrorContext::new()
                    .with_field_path(format!("generator.{}", field))
                    .with_source("config"),
            )
        };
        if self.kind.trim().is_empty() {
            return Err(invalid("type", "generator type must not be empty".into()));
        }
        if self.model_id_or_path.trim().is_empty() {
            return Err(invalid(
                "model_id_or_path",
                "model id must not be empty".into(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(invalid(
                "temperature",
                format!("temperature must be >= 0, got {}", self.temperature),
            ));
        }
        if self.max_new_tokens < self.min_new_tokens {
            return Err(invalid(
                "max_new_tokens",
                format!(
                    "max_new_tokens ({}) is below min_new_tokens ({})",
                    self.max_new_tokens, self.min_new_tokens
                ),
            ));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "batch_size must be at least 1".into()));
        }
        if let Some(ref base) = self.base_url {
            url::Url::parse(base)
                .map_err(|e| invalid("base_url", format!("invalid base_url '{}': {}", base, e)))?;
        }
        Ok(())
    }

    /// Resolve the API key from `api_key_env`. A missing variable is not an
    /// error: local OpenAI-compatible servers usually run without one.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite file. When unset, an in-memory store is used instead.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,
}

fn default_true() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_max_memory_entries() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            max_memory_entries: default_max_memory_entries(),
        }
    }
}

impl CacheConfig {
    /// Store described by this section: disabled → [`NullStore`], a path →
    /// [`SqliteStore`], otherwise a bounded [`MemoryStore`].
    pub fn build_store(&self) -> Box<dyn CacheStore> {
        match (self.enabled, &self.path) {
            (false, _) => Box::new(NullStore::new()),
            (true, Some(path)) => Box::new(
                SqliteStore::new(path).with_busy_timeout(Duration::from_millis(self.busy_timeout_ms)),
            ),
            (true, None) => Box::new(MemoryStore::new(self.max_memory_entries)),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read config: {}", e),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("config"),
            )
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            Error::Configuration { message, context } if context.field_path.is_none() => {
                Error::Configuration {
                    message,
                    context: context.with_field_path(path.display().to_string()),
                }
            }
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig = serde_yaml::from_str(&expanded).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to parse config: {}", e),
                ErrorContext::new().with_source("config"),
            )
        })?;
        config.generator.validate()?;
        Ok(config)
    }
}

static ENV_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var pattern"));

/// Expand `${VAR}` placeholders. Unset variables are left as written.
pub fn expand_env_vars(s: &str) -> String {
    ENV_VAR
        .replace_all(s, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
