//! Memoizing generator.

use super::key::{CacheKey, GeneratorFingerprint, KeyBuilder};
use super::store::{CacheStore, SqliteStore, StoreSession};
use crate::generator::Generator;
use crate::types::{GenerationCall, GenerationOutput, Method, Request};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Positions served from the store
    pub hits: u64,
    /// Unique keys forwarded to the wrapped generator
    pub misses: u64,
    /// Positions served by an earlier identical request in the same batch
    pub deduplicated: u64,
    pub backend_calls: u64,
    pub writes: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses + self.deduplicated;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    deduplicated: AtomicU64,
    backend_calls: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}
impl AtomicStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            backend_calls: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            backend_calls: self.backend_calls.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Wraps a [`Generator`] and memoizes its results in a [`CacheStore`].
///
/// Each call serves stored results directly, forwards one request per
/// distinct missing key to the wrapped generator in a single call, and records
/// the new results atomically before merging them back. The batch keeps its
/// order and its `Request` values; only the result slot is written.
pub struct CachingGenerator {
    inner: Arc<dyn Generator>,
    store: Box<dyn CacheStore>,
    keys: KeyBuilder,
    stats: Arc<AtomicStats>,
}

/// Unique missing key and every batch position that needs its result.
struct PendingKey {
    key: CacheKey,
    positions: Vec<usize>,
}

impl CachingGenerator {
    /// Cache `inner` in a SQLite file at `path`. The file is opened on first use.
    pub fn new(inner: Arc<dyn Generator>, path: impl AsRef<Path>) -> Result<Self> {
        Self::with_store(inner, Box::new(SqliteStore::new(path.as_ref())))
    }

    pub fn with_store(inner: Arc<dyn Generator>, store: Box<dyn CacheStore>) -> Result<Self> {
        let fingerprint = GeneratorFingerprint::from_config(&inner.fingerprint_source())?;
        debug!(
            generator = %inner.name(),
            store = store.name(),
            fingerprint = %fingerprint,
            "caching generator created"
        );
        Ok(Self {
            inner,
            store,
            keys: KeyBuilder::new(fingerprint),
            stats: Arc::new(AtomicStats::new()),
        })
    }

    pub fn fingerprint(&self) -> &GeneratorFingerprint {
        self.keys.fingerprint()
    }

    pub fn key_builder(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn inner(&self) -> &Arc<dyn Generator> {
        &self.inner
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Fill `result_slot` on every request of `batch` and hand the same slice back.
    pub async fn generate<'a, S: AsRef<str>>(
        &self,
        batch: &'a mut [Request],
        field_names: &[S],
        result_slot: &str,
        method: Method,
    ) -> Result<&'a mut [Request]> {
        let call = GenerationCall::new(
            method,
            field_names.iter().map(|f| f.as_ref().to_string()),
            result_slot,
        )?;
        self.execute(batch, &call).await?;
        Ok(batch)
    }

    /// Same as [`generate`](Self::generate) with an already validated call.
    pub async fn execute(&self, batch: &mut [Request], call: &GenerationCall) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let keys = batch
            .iter()
            .map(|req| self.keys.build_key(call.method(), call.field_names(), req))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| self.count_error(e))?;

        let mut session = self.store.open().map_err(|e| self.count_error(e))?;
        let outcome = self.run(session.as_mut(), batch, &keys, call).await;
        match outcome {
            Ok(()) => session.close().map_err(|e| self.count_error(e)),
            Err(e) => {
                // The error from the call wins; the session still has to go.
                if let Err(close_err) = session.close() {
                    warn!(error = %close_err, "failed to close cache session after error");
                }
                Err(self.count_error(e))
            }
        }
    }

    fn count_error(&self, e: Error) -> Error {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        e
    }

    /// Look up a key, downgrading an undecodable entry to a miss.
    fn lookup(&self, session: &mut dyn StoreSession, key: &CacheKey) -> Result<Option<GenerationOutput>> {
        let Some(bytes) = session.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_slice::<GenerationOutput>(&bytes) {
            Ok(output) => Ok(Some(output)),
            Err(e) => {
                warn!(key = %key, error = %e, "undecodable cache entry, recomputing");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn run(
        &self,
        session: &mut dyn StoreSession,
        batch: &mut [Request],
        keys: &[CacheKey],
        call: &GenerationCall,
    ) -> Result<()> {
        let slot = call.result_slot();
        let mut found: HashMap<&CacheKey, GenerationOutput> = HashMap::new();
        let mut pending: Vec<PendingKey> = Vec::new();
        let mut pending_index: HashMap<&CacheKey, usize> = HashMap::new();
        let (mut hits, mut dedup) = (0u64, 0u64);

        for (i, key) in keys.iter().enumerate() {
            if let Some(&p) = pending_index.get(key) {
                pending[p].positions.push(i);
                dedup += 1;
                continue;
            }
            let cached = match found.get(key) {
                Some(output) => Some(output.clone()),
                None => self.lookup(session, key)?,
            };
            match cached {
                Some(output) => {
                    batch[i].set_result(slot, output.clone());
                    found.insert(key, output);
                    hits += 1;
                }
                None => {
                    pending_index.insert(key, pending.len());
                    pending.push(PendingKey {
                        key: key.clone(),
                        positions: vec![i],
                    });
                }
            }
        }

        self.stats.hits.fetch_add(hits, Ordering::Relaxed);
        self.stats.deduplicated.fetch_add(dedup, Ordering::Relaxed);
        self.stats
            .misses
            .fetch_add(pending.len() as u64, Ordering::Relaxed);
        debug!(
            generator = %self.inner.name(),
            method = %call.method(),
            total = batch.len(),
            hits,
            misses = pending.len(),
            deduplicated = dedup,
            "partitioned batch"
        );

        if pending.is_empty() {
            return Ok(());
        }

        let mut sub_batch: Vec<Request> = pending
            .iter()
            .map(|p| batch[p.positions[0]].detached())
            .collect();
        self.stats.backend_calls.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.inner.generate_batch(&mut sub_batch, call).await {
            warn!(
                generator = %self.inner.name(),
                items = sub_batch.len(),
                error = %e,
                "wrapped generator failed, nothing cached"
            );
            return Err(e);
        }

        let mut outputs = Vec::with_capacity(sub_batch.len());
        let mut entries = Vec::with_capacity(sub_batch.len());
        for (p, req) in pending.iter().zip(&sub_batch) {
            let output = req.result(slot).cloned().ok_or_else(|| {
                Error::backend(
                    self.inner.name(),
                    format!("returned without filling '{}' for request {}", slot, req.id()),
                )
            })?;
            entries.push((p.key.clone(), serde_json::to_vec(&output)?));
            outputs.push(output);
        }

        session.put_batch(&entries)?;
        self.stats
            .writes
            .fetch_add(entries.len() as u64, Ordering::Relaxed);

        for (p, output) in pending.iter().zip(outputs) {
            for &i in &p.positions {
                batch[i].set_result(slot, output.clone());
            }
        }

        info!(
            generator = %self.inner.name(),
            method = %call.method(),
            total = batch.len(),
            hits,
            computed = pending.len(),
            "batch generated"
        );
        Ok(())
    }
}

#[async_trait]
impl Generator for CachingGenerator {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn fingerprint_source(&self) -> serde_json::Value {
        self.inner.fingerprint_source()
    }

    async fn generate_batch(&self, batch: &mut [Request], call: &GenerationCall) -> Result<()> {
        self.execute(batch, call).await
    }
}
