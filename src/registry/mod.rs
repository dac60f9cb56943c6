//! Generator registry — maps a configuration `type` to a backend constructor.
//!
//! The registry is an ordinary value built once at startup and passed to
//! whoever needs to construct generators; there is no global lookup table.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::GeneratorConfig;
use crate::generator::{EchoGenerator, Generator, OpenAiGenerator, OpenAiMode};
use crate::{Error, ErrorContext, Result};

/// Builds a generator from its configuration.
pub type GeneratorConstructor = fn(&GeneratorConfig) -> Result<Arc<dyn Generator>>;

#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    constructors: BTreeMap<String, GeneratorConstructor>,
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("types", &self.types())
            .finish()
    }
}

fn build_echo(cfg: &GeneratorConfig) -> Result<Arc<dyn Generator>> {
    Ok(Arc::new(EchoGenerator::from_config(cfg)?))
}

fn build_openai_completions(cfg: &GeneratorConfig) -> Result<Arc<dyn Generator>> {
    Ok(Arc::new(OpenAiGenerator::from_config(
        cfg,
        OpenAiMode::Completions,
    )?))
}

fn build_openai_chat(cfg: &GeneratorConfig) -> Result<Arc<dyn Generator>> {
    Ok(Arc::new(OpenAiGenerator::from_config(cfg, OpenAiMode::Chat)?))
}

impl GeneratorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the backends shipped with this crate.
    pub fn with_builtin() -> Self {
        Self::new()
            .register("echo", build_echo)
            .register("openai", build_openai_completions)
            .register("openai-chat", build_openai_chat)
    }

    /// Add (or replace) the constructor for `kind`.
    pub fn register(mut self, kind: impl Into<String>, ctor: GeneratorConstructor) -> Self {
        self.constructors.insert(kind.into(), ctor);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn build(&self, config: &GeneratorConfig) -> Result<Arc<dyn Generator>> {
        let ctor = self.constructors.get(&config.kind).ok_or_else(|| {
            Error::configuration_with_context(
                format!("unknown generator type '{}'", config.kind),
                ErrorContext::new()
                    .with_field_path("generator.type")
                    .with_details(format!("known types: {}", self.types().join(", ")))
                    .with_source("generator_registry"),
            )
        })?;
        ctor(config)
    }
}
