//! Shared helpers for the storage integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use tuplecache_core::{
    collect, ReadContext, RelationshipTupleReader, SharedIteratorConfig, StorageResult, Tuple,
    TupleIterator,
};
use tuplecache_storage::SharedIteratorReader;
use tuplecache_test_utils::{fixtures, CountingReader, ScriptedReader};

static TRACING: Once = Once::new();

/// Install a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub type Counted = CountingReader<ScriptedReader>;

/// A shared reader over `count` scripted viewer tuples whose streaming reads
/// take `delay` to construct.
pub fn shared_reader(
    count: usize,
    delay: Duration,
    config: SharedIteratorConfig,
) -> Arc<SharedIteratorReader<Counted>> {
    shared_reader_over(
        ScriptedReader::new(fixtures::document_viewer_tuples("1", count)),
        delay,
        config,
    )
}

pub fn shared_reader_over(
    backend: ScriptedReader,
    delay: Duration,
    config: SharedIteratorConfig,
) -> Arc<SharedIteratorReader<Counted>> {
    init_tracing();
    let backend = CountingReader::new(backend).with_construction_delay(delay);
    Arc::new(SharedIteratorReader::new(backend, config).unwrap())
}

/// Drain `iter` with a background context.
pub async fn drain(mut iter: TupleIterator) -> StorageResult<Vec<Tuple>> {
    collect(&mut iter, &ReadContext::background()).await
}

/// A `read` of every viewer of `document:1`.
pub async fn read_viewers<R: RelationshipTupleReader>(
    reader: &R,
    options: tuplecache_core::ReadOptions,
) -> StorageResult<TupleIterator> {
    reader
        .read(
            &ReadContext::background(),
            fixtures::STORE_ID,
            &fixtures::viewers_of("1"),
            options,
        )
        .await
}
