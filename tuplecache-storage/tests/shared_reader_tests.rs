//! Integration tests for the shared iterator reader.
//!
//! Every scenario drives the public `RelationshipTupleReader` surface against
//! a call-counting scripted backend, with tokio time paused so idle and
//! admission timers can be stepped deterministically.

use std::sync::Arc;
use std::time::Duration;

use tuplecache_core::{
    ReadContext, ReadFilter, ReadOptions, ReadUsersetTuplesFilter, RelationshipTupleReader,
    SharedIteratorConfig, StorageError, StorageIterator,
};
use tuplecache_storage::SharedIteratorStats;
use tuplecache_test_utils::{fixtures, ScriptedReader};

mod support;
use support::{drain, read_viewers, shared_reader, shared_reader_over};

const BUILD_DELAY: Duration = Duration::from_millis(50);

// ============================================================================
// SINGLE-FLIGHT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_identical_reads_hit_backend_once() {
    let reader = shared_reader(25, BUILD_DELAY, SharedIteratorConfig::default().with_batch_size(7));
    let counters = reader.inner().counters();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let reader = Arc::clone(&reader);
        handles.push(tokio::spawn(async move {
            let iter = read_viewers(&*reader, ReadOptions::default()).await?;
            drain(iter).await
        }));
    }

    for handle in handles {
        let keys: Vec<_> = handle
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|tuple| tuple.key)
            .collect();
        assert_eq!(keys, fixtures::document_viewers("1", 25));
    }

    assert_eq!(counters.read(), 1);
    assert_eq!(reader.inner().probe().items_yielded(), 25);
    let stats = reader.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 9);
    assert_eq!(stats.cached_entries, 1);
}

#[tokio::test(start_paused = true)]
async fn sequential_reads_within_idle_window_share() {
    let reader = shared_reader(3, BUILD_DELAY, SharedIteratorConfig::default());
    let counters = reader.inner().counters();

    for _ in 0..3 {
        let iter = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
        assert_eq!(drain(iter).await.unwrap().len(), 3);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    assert_eq!(counters.read(), 1);
    assert_eq!(reader.stats().hits, 2);
}

#[tokio::test(start_paused = true)]
async fn operation_kinds_never_share() {
    let reader = shared_reader(2, BUILD_DELAY, SharedIteratorConfig::default());
    let counters = reader.inner().counters();
    let ctx = ReadContext::background();

    let read = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
    let userset = reader
        .read_userset_tuples(
            &ctx,
            fixtures::STORE_ID,
            &ReadUsersetTuplesFilter {
                object: "document:1".to_string(),
                relation: "viewer".to_string(),
                allowed_user_type_restrictions: vec![],
            },
            ReadOptions::default(),
        )
        .await
        .unwrap();
    drain(read).await.unwrap();
    drain(userset).await.unwrap();

    assert_eq!(counters.read(), 1);
    assert_eq!(counters.read_userset_tuples(), 1);
    assert_eq!(reader.stats().cached_entries, 2);
}

#[tokio::test(start_paused = true)]
async fn different_filters_get_different_entries() {
    let reader = shared_reader(2, BUILD_DELAY, SharedIteratorConfig::default());
    let counters = reader.inner().counters();
    let ctx = ReadContext::background();

    for doc in ["1", "2", "1"] {
        let iter = reader
            .read(
                &ctx,
                fixtures::STORE_ID,
                &fixtures::viewers_of(doc),
                ReadOptions::default(),
            )
            .await
            .unwrap();
        drain(iter).await.unwrap();
    }

    assert_eq!(counters.read(), 2);
    assert_eq!(reader.stats().cached_entries, 2);
}

// ============================================================================
// BYPASS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn higher_consistency_always_reads_backend() {
    let reader = shared_reader(3, BUILD_DELAY, SharedIteratorConfig::default());
    let counters = reader.inner().counters();

    for _ in 0..3 {
        let iter = read_viewers(&*reader, ReadOptions::higher_consistency())
            .await
            .unwrap();
        assert_eq!(drain(iter).await.unwrap().len(), 3);
    }

    assert_eq!(counters.read(), 3);
    let stats = reader.stats();
    assert_eq!(stats.cached_entries, 0);
    assert_eq!(stats.bypasses, 3);
    assert_eq!(stats.hits + stats.misses, 0);
}

#[tokio::test(start_paused = true)]
async fn limit_reached_reads_backend_without_new_entry() {
    let reader = shared_reader(2, BUILD_DELAY, SharedIteratorConfig::default().with_limit(1));
    let counters = reader.inner().counters();
    let ctx = ReadContext::background();

    let first = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
    assert_eq!(reader.stats().cached_entries, 1);

    let other = reader
        .read(
            &ctx,
            fixtures::STORE_ID,
            &fixtures::viewers_of("2"),
            ReadOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(drain(other).await.unwrap().len(), 2);

    assert_eq!(counters.read(), 2);
    let stats = reader.stats();
    assert_eq!(stats.cached_entries, 1);
    assert_eq!(stats.bypasses, 1);
    drain(first).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn outgrown_buffer_falls_back_to_backend() {
    let config = SharedIteratorConfig::default()
        .with_batch_size(2)
        .with_max_buffered_items(Some(2));
    let reader = shared_reader(5, BUILD_DELAY, config);
    let counters = reader.inner().counters();

    let first = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
    let keys: Vec<_> = drain(first).await.unwrap().into_iter().map(|t| t.key).collect();
    assert_eq!(keys, fixtures::document_viewers("1", 5));

    // The entry is still cached but has buffered past its bound.
    let second = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
    let keys: Vec<_> = drain(second).await.unwrap().into_iter().map(|t| t.key).collect();
    assert_eq!(keys, fixtures::document_viewers("1", 5));

    assert_eq!(counters.read(), 2);
    let stats = reader.stats();
    assert_eq!(stats.cached_entries, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.bypasses, 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_reader_is_pass_through() {
    let reader = shared_reader(2, BUILD_DELAY, SharedIteratorConfig::default().with_enabled(false));
    let counters = reader.inner().counters();

    for _ in 0..2 {
        let iter = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
        drain(iter).await.unwrap();
    }

    assert_eq!(counters.read(), 2);
    assert_eq!(reader.stats(), SharedIteratorStats::default());
}

// ============================================================================
// EVICTION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn idle_entry_is_evicted_and_rebuilt() {
    let reader = shared_reader(2, BUILD_DELAY, SharedIteratorConfig::default());
    let counters = reader.inner().counters();

    drain(read_viewers(&*reader, ReadOptions::default()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(reader.stats().cached_entries, 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(reader.stats().cached_entries, 0);

    drain(read_viewers(&*reader, ReadOptions::default()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(counters.read(), 2);
    assert_eq!(reader.stats().misses, 2);
}

#[tokio::test(start_paused = true)]
async fn admission_timeout_caps_reuse() {
    let config = SharedIteratorConfig::default()
        .with_admission_timeout(Duration::from_secs(3))
        .with_idle_timeout(Duration::from_secs(2));
    let reader = shared_reader(2, BUILD_DELAY, config);
    let counters = reader.inner().counters();

    // Reused every 500ms, so the idle timer never fires.
    for _ in 0..5 {
        drain(read_viewers(&*reader, ReadOptions::default()).await.unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(counters.read(), 1);

    tokio::time::sleep(Duration::from_millis(800)).await;
    drain(read_viewers(&*reader, ReadOptions::default()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(counters.read(), 2);
}

#[tokio::test(start_paused = true)]
async fn backend_released_after_eviction_and_last_handle() {
    let reader = shared_reader(4, BUILD_DELAY, SharedIteratorConfig::default());
    let probe = reader.inner().probe();

    let mut a = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
    let b = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
    assert_eq!(probe.iterators_created(), 1);

    drain(b).await.unwrap();
    assert_eq!(probe.stop_calls(), 0);

    // Eviction drops the cache's own reference; `a` still holds one.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(reader.stats().cached_entries, 0);
    assert_eq!(probe.stop_calls(), 0);

    let ctx = ReadContext::background();
    assert!(a.next(&ctx).await.is_ok());
    a.stop();
    assert_eq!(probe.stop_calls(), 1);
}

// ============================================================================
// ERRORS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn construction_error_reaches_every_waiter_then_clears() {
    let backend = ScriptedReader::new(fixtures::document_viewer_tuples("1", 2))
        .fail_next_construction(StorageError::query_failed("connection refused"));
    let reader = shared_reader_over(backend, BUILD_DELAY, SharedIteratorConfig::default());
    let counters = reader.inner().counters();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let reader = Arc::clone(&reader);
        handles.push(tokio::spawn(async move {
            read_viewers(&*reader, ReadOptions::default())
                .await
                .map(|_| ())
        }));
    }
    for handle in handles {
        assert_eq!(
            handle.await.unwrap(),
            Err(StorageError::query_failed("connection refused"))
        );
    }
    assert_eq!(counters.read(), 1);
    assert_eq!(reader.stats().cached_entries, 0);

    let retry = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
    assert_eq!(drain(retry).await.unwrap().len(), 2);
    assert_eq!(counters.read(), 2);
    assert_eq!(reader.stats().cached_entries, 1);
}

#[tokio::test(start_paused = true)]
async fn mid_stream_error_is_seen_by_every_handle() {
    let backend = ScriptedReader::new(fixtures::document_viewer_tuples("1", 3))
        .failing_with(StorageError::query_failed("stream reset"));
    let reader = shared_reader_over(backend, BUILD_DELAY, SharedIteratorConfig::default());
    let ctx = ReadContext::background();

    let mut a = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
    let mut b = read_viewers(&*reader, ReadOptions::default()).await.unwrap();

    for iter in [&mut a, &mut b] {
        for _ in 0..3 {
            assert!(iter.next(&ctx).await.is_ok());
        }
        assert_eq!(
            iter.next(&ctx).await,
            Err(StorageError::query_failed("stream reset"))
        );
        assert_eq!(
            iter.next(&ctx).await,
            Err(StorageError::query_failed("stream reset"))
        );
    }
    assert_eq!(reader.inner().counters().read(), 1);
    assert_eq!(reader.inner().probe().next_calls(), 4);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn impatient_waiter_does_not_disturb_build() {
    let reader = shared_reader(3, BUILD_DELAY, SharedIteratorConfig::default());
    let counters = reader.inner().counters();

    let patient = {
        let reader = Arc::clone(&reader);
        tokio::spawn(async move {
            let iter = read_viewers(&*reader, ReadOptions::default()).await?;
            drain(iter).await
        })
    };
    tokio::task::yield_now().await;

    let short = ReadContext::background().with_timeout(Duration::from_millis(10));
    let result = reader
        .read(
            &short,
            fixtures::STORE_ID,
            &fixtures::viewers_of("1"),
            ReadOptions::default(),
        )
        .await;
    assert!(matches!(result, Err(StorageError::DeadlineExceeded)));

    assert_eq!(patient.await.unwrap().unwrap().len(), 3);
    assert_eq!(counters.read(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_builder_leaves_no_stuck_entry() {
    let reader = shared_reader(
        5,
        Duration::from_millis(100),
        SharedIteratorConfig::default().with_limit(1),
    );
    let counters = reader.inner().counters();
    let probe = reader.inner().probe();

    let short = ReadContext::background().with_timeout(Duration::from_millis(10));
    let result = reader
        .read(
            &short,
            fixtures::STORE_ID,
            &fixtures::viewers_of("1"),
            ReadOptions::default(),
        )
        .await;
    assert!(matches!(result, Err(StorageError::DeadlineExceeded)));

    // The build finishes without its caller and the idle timer reclaims it.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(reader.stats().cached_entries, 0);
    assert_eq!(counters.read(), 1);
    assert_eq!(probe.stop_calls(), 1);

    let ctx = ReadContext::background();
    let other = reader
        .read(
            &ctx,
            fixtures::STORE_ID,
            &fixtures::viewers_of("2"),
            ReadOptions::default(),
        )
        .await
        .unwrap();
    drain(other).await.unwrap();

    let stats = reader.stats();
    assert_eq!(stats.bypasses, 0);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.cached_entries, 1);
}

// ============================================================================
// TEARDOWN
// ============================================================================

#[tokio::test(start_paused = true)]
async fn close_evicts_everything_and_bypasses_afterwards() {
    let reader = shared_reader(2, BUILD_DELAY, SharedIteratorConfig::default());
    let counters = reader.inner().counters();
    let probe = reader.inner().probe();
    let ctx = ReadContext::background();

    let mut held = read_viewers(&*reader, ReadOptions::default()).await.unwrap();
    drain(
        reader
            .read(&ctx, fixtures::STORE_ID, &ReadFilter::default(), ReadOptions::default())
            .await
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(reader.stats().cached_entries, 2);

    reader.close();
    reader.close();
    assert!(reader.is_closed());
    assert_eq!(reader.stats().cached_entries, 0);
    assert_eq!(probe.stop_calls(), 1);

    // The held handle still reads to the end.
    assert!(held.next(&ctx).await.is_ok());
    held.stop();
    assert_eq!(probe.stop_calls(), 2);

    let before = counters.read();
    drain(read_viewers(&*reader, ReadOptions::default()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(counters.read(), before + 1);
    assert_eq!(reader.stats().cached_entries, 0);
}
