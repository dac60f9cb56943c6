//! End-to-end behavior of the caching layer against counting test doubles.

mod common;

use common::{arithmetic_prompts, CountingGenerator, CountingStore, StoreCounters};
use dgt_lm::cache::{CacheStore, CachingGenerator, MemoryStore, SqliteStore};
use dgt_lm::{Error, GenerationOutput, Generator, Method, Request};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn memory_cached(backend: Arc<CountingGenerator>) -> (CachingGenerator, MemoryStore, Arc<StoreCounters>) {
    let store = MemoryStore::new(1024);
    let (counting, counters) = CountingStore::new(store.clone());
    let cached = CachingGenerator::with_store(backend, Box::new(counting)).unwrap();
    (cached, store, counters)
}

fn texts(batch: &[Request], slot: &str) -> Vec<String> {
    batch
        .iter()
        .map(|r| r.result(slot).and_then(|o| o.as_text()).unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_cold_then_warm_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.db");
    let backend = CountingGenerator::new("granite");
    let cached = CachingGenerator::new(backend.clone(), &path).unwrap();

    let mut first = arithmetic_prompts(25);
    cached
        .generate(&mut first, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.calls(), 1);
    assert_eq!(backend.items(), 25);

    let mut second = arithmetic_prompts(25);
    cached
        .generate(&mut second, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.calls(), 1, "warm run must not reach the backend");
    assert_eq!(texts(&first, "output"), texts(&second, "output"));

    let stats = cached.stats();
    assert_eq!(stats.misses, 25);
    assert_eq!(stats.hits, 25);
    assert_eq!(stats.writes, 25);
    assert!((stats.hit_ratio() - 0.5).abs() < 1e-12);
}

#[tokio::test]
async fn test_partial_hits_forward_only_misses() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, _) = memory_cached(backend.clone());

    let mut warm = arithmetic_prompts(3);
    cached
        .generate(&mut warm, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();

    let mut mixed = arithmetic_prompts(5);
    cached
        .generate(&mut mixed, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.calls(), 2);
    let forwarded = backend.last_batch();
    assert_eq!(forwarded.len(), 2);
    assert_eq!(forwarded[0].id(), mixed[3].id());
    assert_eq!(forwarded[1].id(), mixed[4].id());
    assert!(mixed.iter().all(|r| r.result("output").is_some()));
}

#[tokio::test]
async fn test_order_identity_and_metadata_preserved() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, _) = memory_cached(backend.clone());

    let mut batch: Vec<Request> = ["c", "a", "b"]
        .iter()
        .enumerate()
        .map(|(i, p)| {
            Request::new()
                .with_field("prompt", *p)
                .with_field("seed_id", i as u64)
                .with_field("meta", json!({"source": "seed", "rank": i}))
        })
        .collect();
    let ids: Vec<_> = batch.iter().map(Request::id).collect();

    let out = cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(out.len(), 3);
    assert_eq!(out.iter().map(Request::id).collect::<Vec<_>>(), ids);
    assert_eq!(
        texts(out, "output"),
        vec![
            backend.expected_text("c"),
            backend.expected_text("a"),
            backend.expected_text("b")
        ]
    );
    for (i, req) in batch.iter().enumerate() {
        assert_eq!(req.field("seed_id"), Some(&json!(i as u64)));
        assert_eq!(req.field("meta").unwrap()["rank"], json!(i));
    }
}

#[tokio::test]
async fn test_unselected_fields_do_not_affect_hits() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, _) = memory_cached(backend.clone());

    let mut first = vec![Request::new().with_field("prompt", "p").with_field("tag", "x")];
    let mut second = vec![Request::new().with_field("prompt", "p").with_field("tag", "y")];
    cached
        .generate(&mut first, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    cached
        .generate(&mut second, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.calls(), 1);
    assert_eq!(second[0].field("tag"), Some(&json!("y")));
}

#[tokio::test]
async fn test_intra_batch_duplicates_computed_once() {
    let backend = CountingGenerator::new("granite");
    let (cached, store, _) = memory_cached(backend.clone());

    let mut batch: Vec<Request> = ["same", "other", "same", "same"]
        .iter()
        .map(|p| Request::new().with_field("prompt", *p))
        .collect();
    cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();

    assert_eq!(backend.items(), 2);
    assert_eq!(store.open().unwrap().len().unwrap(), 2);
    let out = texts(&batch, "output");
    assert_eq!(out[0], out[2]);
    assert_eq!(out[0], out[3]);
    assert_eq!(cached.stats().deduplicated, 2);
    assert_ne!(batch[0].id(), batch[2].id());
}

#[tokio::test]
async fn test_backend_failure_writes_nothing() {
    let backend = CountingGenerator::new("granite");
    let (cached, store, counters) = memory_cached(backend.clone());

    backend.fail_next(true);
    let mut batch = arithmetic_prompts(4);
    let err = cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend { .. }));
    assert!(err.is_retryable());
    assert_eq!(StoreCounters::get(&counters.put_batches), 0);
    assert_eq!(StoreCounters::get(&counters.closes), 1);
    assert_eq!(store.open().unwrap().len().unwrap(), 0);
    assert!(batch.iter().all(|r| r.result("output").is_none()));

    backend.fail_next(false);
    cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.calls(), 2);
    assert_eq!(store.open().unwrap().len().unwrap(), 4);
}

#[tokio::test]
async fn test_hits_survive_backend_failure() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, _) = memory_cached(backend.clone());

    let mut warm = arithmetic_prompts(1);
    cached
        .generate(&mut warm, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();

    backend.fail_next(true);
    let mut batch = arithmetic_prompts(2);
    assert!(cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .is_err());
    assert!(batch[0].result("output").is_some());
    assert!(batch[1].result("output").is_none());
}

#[tokio::test]
async fn test_unfilled_slot_is_an_error_and_not_cached() {
    let backend = CountingGenerator::new("granite");
    let (cached, store, _) = memory_cached(backend.clone());

    backend.skip_slot(true);
    let mut batch = arithmetic_prompts(2);
    let err = cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend { .. }));
    assert_eq!(store.open().unwrap().len().unwrap(), 0);
}

#[tokio::test]
async fn test_loglikelihood_arity_checked_before_any_io() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, counters) = memory_cached(backend.clone());

    let mut batch = vec![Request::new().with_field("context", "The sky is")];
    let err = cached
        .generate(&mut batch, &["context"], "score", Method::LogLikelihood)
        .await
        .unwrap_err();
    match err {
        Error::MethodMismatch { method, actual, .. } => {
            assert_eq!(method, "loglikelihood");
            assert_eq!(actual, 1);
        }
        other => panic!("expected MethodMismatch, got {other:?}"),
    }
    assert_eq!(backend.calls(), 0);
    assert!(!counters.touched());
}

#[tokio::test]
async fn test_generate_without_fields_rejected() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, counters) = memory_cached(backend.clone());
    let mut batch = arithmetic_prompts(1);
    let none: [&str; 0] = [];
    let err = cached
        .generate(&mut batch, &none, "output", Method::Generate)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MethodMismatch { .. }));
    assert!(!counters.touched());
}

#[tokio::test]
async fn test_loglikelihood_results_are_numbers() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, _) = memory_cached(backend.clone());

    let mut batch = vec![
        Request::new()
            .with_field("context", "The sky is")
            .with_field("continuation", " blue"),
        Request::new()
            .with_field("context", "The sky is")
            .with_field("continuation", " green and wet"),
    ];
    cached
        .generate(&mut batch, &["context", "continuation"], "score", Method::LogLikelihood)
        .await
        .unwrap();
    let scores: Vec<f64> = batch
        .iter()
        .map(|r| r.result("score").and_then(GenerationOutput::as_loglikelihood).unwrap())
        .collect();
    assert!(scores[0] > scores[1]);
    assert_eq!(batch[0].to_record()["score"], json!(scores[0]));

    // Same inputs under generate are a different key.
    cached
        .generate(&mut batch, &["context", "continuation"], "text", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_empty_batch_touches_nothing() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, counters) = memory_cached(backend.clone());
    let mut batch: Vec<Request> = Vec::new();
    let out = cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert!(out.is_empty());
    assert_eq!(backend.calls(), 0);
    assert!(!counters.touched());
}

#[tokio::test]
async fn test_missing_selected_field_fails_before_store() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, counters) = memory_cached(backend.clone());
    let mut batch = vec![
        Request::new().with_field("prompt", "ok"),
        Request::new().with_field("question", "wrong field"),
    ];
    let err = cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KeyEncoding { .. }));
    assert!(!counters.touched());
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_session_closed_after_every_call() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, counters) = memory_cached(backend.clone());
    for _ in 0..3 {
        let mut batch = arithmetic_prompts(2);
        cached
            .generate(&mut batch, &["prompt"], "output", Method::Generate)
            .await
            .unwrap();
    }
    assert_eq!(StoreCounters::get(&counters.opens), 3);
    assert_eq!(StoreCounters::get(&counters.closes), 3);
    assert_eq!(StoreCounters::get(&counters.put_batches), 1);
}

#[tokio::test]
async fn test_persistence_across_instances() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("lm.db");

    let first_backend = CountingGenerator::new("granite");
    let first = CachingGenerator::new(first_backend.clone(), &path).unwrap();
    let mut batch = arithmetic_prompts(5);
    first
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    let expected = texts(&batch, "output");
    drop(first);

    let second_backend = CountingGenerator::new("granite");
    let second = CachingGenerator::new(second_backend.clone(), &path).unwrap();
    let mut again = arithmetic_prompts(5);
    second
        .generate(&mut again, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(second_backend.calls(), 0);
    assert_eq!(texts(&again, "output"), expected);
}

#[tokio::test]
async fn test_deleting_cache_file_resets_running_instance() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lm.db");
    let backend = CountingGenerator::new("granite");
    let cached = CachingGenerator::new(backend.clone(), &path).unwrap();

    let mut batch = arithmetic_prompts(3);
    cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.items(), 3);

    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
    }

    let mut again = arithmetic_prompts(3);
    cached
        .generate(&mut again, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.calls(), 2);
    assert_eq!(backend.items(), 6);
    assert_eq!(texts(&again, "output"), texts(&batch, "output"));

    // The recomputed entries were written to the fresh file.
    let mut warm = arithmetic_prompts(3);
    cached
        .generate(&mut warm, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_different_fingerprint_shares_file_without_hits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lm.db");

    let granite = CountingGenerator::new("granite");
    let mut batch = arithmetic_prompts(3);
    CachingGenerator::new(granite.clone(), &path)
        .unwrap()
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();

    let llama = CountingGenerator::new("llama");
    let cached = CachingGenerator::new(llama.clone(), &path).unwrap();
    let mut other = arithmetic_prompts(3);
    cached
        .generate(&mut other, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(llama.items(), 3);
    assert_ne!(texts(&batch, "output"), texts(&other, "output"));
    assert_eq!(SqliteStore::new(&path).open().unwrap().len().unwrap(), 6);
}

#[tokio::test]
async fn test_field_order_changes_key() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, _) = memory_cached(backend.clone());
    let req = Request::new().with_field("prompt1", "A").with_field("prompt2", "B");

    let mut ab = vec![req.clone()];
    cached
        .generate(&mut ab, &["prompt1", "prompt2"], "output", Method::Generate)
        .await
        .unwrap();
    let mut ba = vec![req];
    cached
        .generate(&mut ba, &["prompt2", "prompt1"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.calls(), 2);
    assert_eq!(texts(&ab, "output"), vec![backend.expected_text("A\nB")]);
    assert_eq!(texts(&ba, "output"), vec![backend.expected_text("B\nA")]);
}

#[tokio::test]
async fn test_corrupt_entry_recomputed() {
    let backend = CountingGenerator::new("granite");
    let (cached, store, _) = memory_cached(backend.clone());
    let req = Request::new().with_field("prompt", "p");
    let key = cached
        .key_builder()
        .build_key(Method::Generate, &["prompt"], &req)
        .unwrap();
    store
        .open()
        .unwrap()
        .put_batch(&[(key, b"not json".to_vec())])
        .unwrap();

    let mut batch = vec![req];
    cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.calls(), 1);
    assert_eq!(texts(&batch, "output"), vec![backend.expected_text("p")]);
    assert_eq!(cached.stats().errors, 1);
}

#[tokio::test]
async fn test_unopenable_store_is_fatal() {
    let dir = TempDir::new().unwrap();
    let backend = CountingGenerator::new("granite");
    // A directory cannot be opened as a database file.
    let cached = CachingGenerator::new(backend.clone(), dir.path()).unwrap();
    let mut batch = arithmetic_prompts(1);
    let err = cached
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store { .. }));
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_caching_generator_is_a_generator() {
    let backend = CountingGenerator::new("granite");
    let (cached, _, _) = memory_cached(backend.clone());
    let as_generator: Arc<dyn Generator> = Arc::new(cached);
    assert_eq!(as_generator.name(), "counting");

    // Nesting caches keeps keys stable because the fingerprint source passes through.
    let outer = CachingGenerator::with_store(as_generator, Box::new(MemoryStore::new(16))).unwrap();
    let mut batch = arithmetic_prompts(2);
    outer
        .generate(&mut batch, &["prompt"], "output", Method::Generate)
        .await
        .unwrap();
    assert_eq!(backend.items(), 2);
}
