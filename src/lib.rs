//! # dgt-lm
//!
//! Batched, memoizing language-model generation for synthetic data pipelines.
//!
//! ## Overview
//!
//! Pipelines drive one or more pluggable model backends through a single
//! batched contract, [`Generator`]. Wrapping any backend in a
//! [`CachingGenerator`] makes repeated work free: every (backend
//! configuration, method, input) triple is computed once, persisted, and
//! served from disk afterwards, while batch order, request identity and
//! result slots stay exactly as the caller passed them.
//!
//! ## Key Features
//!
//! - **Two methods**: free-text `generate` and `loglikelihood` scoring
//! - **Deterministic keys**: canonical, order-sensitive encoding of the selected fields
//! - **Intra-batch dedup**: identical requests in one batch are computed once
//! - **Atomic persistence**: new results are committed in one SQLite transaction,
//!   only after the backend call succeeded
//! - **Explicit registry**: backends are chosen by config `type` via [`GeneratorRegistry`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dgt_lm::{AppConfig, CachingGenerator, GeneratorRegistry, Method, Request};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> dgt_lm::Result<()> {
//!     let config = AppConfig::from_file(Path::new("generator.yaml"))?;
//!     let backend = GeneratorRegistry::with_builtin().build(&config.generator)?;
//!     let cached = CachingGenerator::new(backend, ".cache/lm.db")?;
//!
//!     let mut batch: Vec<Request> = (0..25)
//!         .map(|i| Request::new().with_field("prompt", format!("Question: x = {} + 1\nAnswer: x =", i)))
//!         .collect();
//!     cached.generate(&mut batch, &["prompt"], "output", Method::Generate).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Requests, outputs, methods |
//! | [`generator`] | The [`Generator`] contract and built-in backends |
//! | [`cache`] | Keys, stores and the caching generator |
//! | [`registry`] | Config type → backend constructor map |
//! | [`config`] | YAML configuration |

pub mod cache;
pub mod config;
pub mod generator;
pub mod registry;
pub mod types;

pub use cache::{CacheKey, CacheStats, CachingGenerator, GeneratorFingerprint, KeyBuilder};
pub use config::{AppConfig, CacheConfig, GeneratorConfig};
pub use generator::Generator;
pub use registry::GeneratorRegistry;
pub use types::{GenerationCall, GenerationOutput, Method, Request, RequestBatch};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
