//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use dgt_lm::cache::{CacheKey, CacheStore, StoreSession};
use dgt_lm::{Error, GenerationCall, GenerationOutput, Generator, Method, Request, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Deterministic backend that records every batch it receives.
pub struct CountingGenerator {
    model: String,
    calls: AtomicUsize,
    items: AtomicUsize,
    seen: Mutex<Vec<Vec<Request>>>,
    fail: AtomicBool,
    skip_slot: AtomicBool,
}

impl CountingGenerator {
    pub fn new(model: &str) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            calls: AtomicUsize::new(0),
            items: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            skip_slot: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests forwarded across all calls.
    pub fn items(&self) -> usize {
        self.items.load(Ordering::SeqCst)
    }

    pub fn last_batch(&self) -> Vec<Request> {
        self.seen.lock().unwrap().last().cloned().unwrap_or_default()
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Return success without writing the result slot.
    pub fn skip_slot(&self, skip: bool) {
        self.skip_slot.store(skip, Ordering::SeqCst);
    }

    pub fn expected_text(&self, prompt: &str) -> String {
        format!("{}::{}", self.model, prompt.to_uppercase())
    }
}

fn text(req: &Request, name: &str) -> String {
    match req.field(name) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl Generator for CountingGenerator {
    fn name(&self) -> &str {
        "counting"
    }

    fn fingerprint_source(&self) -> Value {
        json!({ "type": "counting", "model": self.model })
    }

    async fn generate_batch(&self, batch: &mut [Request], call: &GenerationCall) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.items.fetch_add(batch.len(), Ordering::SeqCst);
        self.seen.lock().unwrap().push(batch.to_vec());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::backend_retryable("counting", "HTTP 503 from backend"));
        }
        if self.skip_slot.load(Ordering::SeqCst) {
            return Ok(());
        }
        for req in batch.iter_mut() {
            let output = match call.method() {
                Method::Generate => {
                    let prompt = call
                        .field_names()
                        .iter()
                        .map(|f| text(req, f))
                        .collect::<Vec<_>>()
                        .join("\n");
                    GenerationOutput::Text(self.expected_text(&prompt))
                }
                Method::LogLikelihood => {
                    let fields = call.field_names();
                    GenerationOutput::LogLikelihood(
                        -(text(req, &fields[1]).len() as f64) / (1.0 + text(req, &fields[0]).len() as f64),
                    )
                }
            };
            req.set_result(call.result_slot(), output);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StoreCounters {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub gets: AtomicUsize,
    pub put_batches: AtomicUsize,
    pub entries_written: AtomicUsize,
}

impl StoreCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn touched(&self) -> bool {
        Self::get(&self.opens) + Self::get(&self.gets) + Self::get(&self.put_batches) > 0
    }
}

/// Wraps another store and counts what the caching layer does with it.
pub struct CountingStore<S> {
    inner: S,
    counters: Arc<StoreCounters>,
}

impl<S: CacheStore> CountingStore<S> {
    pub fn new(inner: S) -> (Self, Arc<StoreCounters>) {
        let counters = Arc::new(StoreCounters::default());
        (
            Self {
                inner,
                counters: counters.clone(),
            },
            counters,
        )
    }
}

impl<S: CacheStore> CacheStore for CountingStore<S> {
    fn open(&self) -> Result<Box<dyn StoreSession>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingSession {
            inner: self.inner.open()?,
            counters: self.counters.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

struct CountingSession {
    inner: Box<dyn StoreSession>,
    counters: Arc<StoreCounters>,
}

impl StoreSession for CountingSession {
    fn get(&mut self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn put_batch(&mut self, entries: &[(CacheKey, Vec<u8>)]) -> Result<()> {
        self.counters.put_batches.fetch_add(1, Ordering::SeqCst);
        self.counters
            .entries_written
            .fetch_add(entries.len(), Ordering::SeqCst);
        self.inner.put_batch(entries)
    }

    fn len(&mut self) -> Result<usize> {
        self.inner.len()
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

pub fn arithmetic_prompts(n: usize) -> Vec<Request> {
    (0..n)
        .map(|i| Request::new().with_field("prompt", format!("Question: x = {} + 1\nAnswer: x =", i)))
        .collect()
}
