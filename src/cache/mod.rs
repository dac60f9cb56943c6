//! # Generation Cache Module
//!
//! Memoizes generator results so that a (generator configuration, method,
//! input) triple is computed at most once, across batches and across process
//! restarts.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CachingGenerator`] | Wraps any [`Generator`](crate::generator::Generator) and serves repeats from the store |
//! | [`KeyBuilder`] | Derives a [`CacheKey`] from fingerprint, method and selected fields |
//! | [`GeneratorFingerprint`] | Digest of the output-affecting generator configuration |
//! | [`CacheStore`] | Trait for stores handing out scoped [`StoreSession`]s |
//! | [`SqliteStore`] | Durable single-file store |
//! | [`MemoryStore`] | Process-local LRU store |
//! | [`NullStore`] | No-op store for disabling caching |
//! | [`CacheStats`] | Hit / miss / write counters |
//!
//! ## Example
//!
//! ```rust,no_run
//! use dgt_lm::cache::CachingGenerator;
//! use dgt_lm::config::GeneratorConfig;
//! use dgt_lm::generator::EchoGenerator;
//! use dgt_lm::types::{Method, Request};
//! use std::sync::Arc;
//!
//! # async fn run() -> dgt_lm::Result<()> {
//! let backend = Arc::new(EchoGenerator::new(GeneratorConfig::new("echo", "none")));
//! let cached = CachingGenerator::new(backend, ".cache/lm.db")?;
//!
//! let mut batch = vec![Request::new().with_field("prompt", "Question: x = 1 + 1\nAnswer: x =")];
//! cached.generate(&mut batch, &["prompt"], "output", Method::Generate).await?;
//! assert!(batch[0].result("output").is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Cache Keys
//!
//! Keys cover the generator fingerprint, the method, and the selected input
//! fields in caller order. Unselected fields and request ids never affect the
//! key, so metadata can ride along freely. Because the fingerprint is part of
//! every key, entries from differently configured generators can share one
//! store file without colliding.

mod generator;
mod key;
mod store;

pub use generator::{CacheStats, CachingGenerator};
pub use key::{build_key, CacheKey, GeneratorFingerprint, KeyBuilder};
pub use store::{CacheStore, MemoryStore, NullStore, SqliteStore, StoreSession};
