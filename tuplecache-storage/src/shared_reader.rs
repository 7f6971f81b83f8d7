//! Request-deduplicating decorator over a [`RelationshipTupleReader`].
//!
//! Concurrent identical streaming reads share one backend iterator: the first
//! caller builds it, later callers receive independent handles over the same
//! buffered results. Reads that ask for higher consistency, reads arriving
//! while the entry limit is reached and reads racing an eviction all go
//! straight to the backend instead. Paged reads and point lookups are always
//! passed through.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tuplecache_core::{
    ConfigError, Pagination, ReadContext, ReadFilter, ReadOptions, ReadStartingWithUserFilter,
    ReadUsersetTuplesFilter, RelationshipTupleReader, SharedIteratorConfig, StorageResult, Tuple,
    TupleIterator, TupleKey,
};

use crate::cache::{
    AdmissionControl, BypassReason, CacheKey, EntryMap, EntrySettings, KeyDeriver, Lookup,
    OperationKind, Producer, ProducerFuture, Sha256KeyDeriver,
};

/// Point-in-time counters for a [`SharedIteratorReader`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedIteratorStats {
    /// Entries currently cached across all operation kinds.
    pub cached_entries: usize,
    /// Streaming reads served from an existing entry.
    pub hits: u64,
    /// Streaming reads that built a new entry.
    pub misses: u64,
    /// Streaming reads sent straight to the backend.
    pub bypasses: u64,
}

impl SharedIteratorStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
}

/// Drop-in [`RelationshipTupleReader`] that shares streaming reads between
/// concurrent identical callers.
pub struct SharedIteratorReader<R> {
    inner: Arc<R>,
    config: SharedIteratorConfig,
    keys: Arc<dyn KeyDeriver>,
    admission: Arc<AdmissionControl>,
    reads: Arc<EntryMap<Tuple>>,
    userset_reads: Arc<EntryMap<Tuple>>,
    starting_with_user_reads: Arc<EntryMap<Tuple>>,
    closed: AtomicBool,
    counters: Counters,
}

impl<R> SharedIteratorReader<R>
where
    R: RelationshipTupleReader + 'static,
{
    /// Wrap `inner`. Fails if `config` does not validate.
    pub fn new(inner: R, config: SharedIteratorConfig) -> Result<Self, ConfigError> {
        Self::from_arc(Arc::new(inner), config)
    }

    /// Wrap a backend that is also used elsewhere.
    pub fn from_arc(inner: Arc<R>, config: SharedIteratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let admission = Arc::new(AdmissionControl::new(config.limit));
        let settings = EntrySettings::from(&config);
        Ok(Self {
            inner,
            keys: Arc::new(Sha256KeyDeriver),
            reads: EntryMap::new(Arc::clone(&admission), settings),
            userset_reads: EntryMap::new(Arc::clone(&admission), settings),
            starting_with_user_reads: EntryMap::new(Arc::clone(&admission), settings),
            admission,
            config,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// Replace the default SHA-256 key derivation.
    pub fn with_key_deriver(mut self, keys: impl KeyDeriver + 'static) -> Self {
        self.keys = Arc::new(keys);
        self
    }

    pub fn inner(&self) -> &Arc<R> {
        &self.inner
    }

    pub fn config(&self) -> &SharedIteratorConfig {
        &self.config
    }

    pub fn stats(&self) -> SharedIteratorStats {
        SharedIteratorStats {
            cached_entries: self.admission.live(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Evict every cached entry and send all later reads to the backend.
    ///
    /// Handles already given out keep working until their holders stop them.
    /// Calling this more than once is harmless.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for map in [&self.reads, &self.userset_reads, &self.starting_with_user_reads] {
            map.evict_all();
        }
        tracing::debug!(remaining = self.admission.live(), "shared iterator reader closed");
    }

    fn map(&self, kind: OperationKind) -> &Arc<EntryMap<Tuple>> {
        match kind {
            OperationKind::Read => &self.reads,
            OperationKind::ReadUsersetTuples => &self.userset_reads,
            OperationKind::ReadStartingWithUser => &self.starting_with_user_reads,
        }
    }

    /// Whether a streaming read with `options` may use the cache at all.
    fn may_share(&self, options: &ReadOptions) -> bool {
        if !self.config.enabled {
            return false;
        }
        if options.requires_fresh() || self.is_closed() {
            self.counters.bypasses.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Resolve a cache lookup for `key`. `Ok(None)` means the caller should
    /// read the backend directly.
    async fn lookup(
        &self,
        ctx: &ReadContext,
        kind: OperationKind,
        key: CacheKey,
        producer: Producer<Tuple>,
    ) -> StorageResult<Option<TupleIterator>> {
        ctx.check()?;

        let map = self.map(kind);
        let lookup = tokio::select! {
            lookup = map.acquire(key.clone(), producer) => lookup?,
            err = ctx.done() => return Err(err),
        };

        match lookup {
            Lookup::Shared { iter, created } => {
                if created {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(kind = %kind, key = %key, "created shared iterator entry");
                } else {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(kind = %kind, key = %key, "shared iterator hit");
                }
                let iter: TupleIterator = Box::new(iter);
                Ok(Some(iter))
            }
            Lookup::Bypass(reason) => {
                self.counters.bypasses.fetch_add(1, Ordering::Relaxed);
                match reason {
                    BypassReason::Capacity => tracing::debug!(
                        kind = %kind,
                        limit = self.admission.limit(),
                        "shared iterator limit reached, reading backend directly"
                    ),
                    BypassReason::Unavailable => tracing::trace!(
                        kind = %kind,
                        key = %key,
                        "shared iterator unavailable, reading backend directly"
                    ),
                }
                Ok(None)
            }
        }
    }
}

// ============================================================================
// PRODUCERS
// ============================================================================
//
// Producers run on behalf of every caller sharing an entry, so they read with a
// detached context: one caller giving up must not fail the build for the rest.

fn read_producer<R>(
    inner: &Arc<R>,
    ctx: &ReadContext,
    store_id: &str,
    filter: &ReadFilter,
    options: ReadOptions,
) -> Producer<Tuple>
where
    R: RelationshipTupleReader + 'static,
{
    let inner = Arc::clone(inner);
    let ctx = ctx.detached();
    let store_id = store_id.to_string();
    let filter = filter.clone();
    Box::new(move || -> ProducerFuture<Tuple> {
        let inner = Arc::clone(&inner);
        let ctx = ctx.clone();
        let store_id = store_id.clone();
        let filter = filter.clone();
        Box::pin(async move { inner.read(&ctx, &store_id, &filter, options).await })
    })
}

fn userset_producer<R>(
    inner: &Arc<R>,
    ctx: &ReadContext,
    store_id: &str,
    filter: &ReadUsersetTuplesFilter,
    options: ReadOptions,
) -> Producer<Tuple>
where
    R: RelationshipTupleReader + 'static,
{
    let inner = Arc::clone(inner);
    let ctx = ctx.detached();
    let store_id = store_id.to_string();
    let filter = filter.clone();
    Box::new(move || -> ProducerFuture<Tuple> {
        let inner = Arc::clone(&inner);
        let ctx = ctx.clone();
        let store_id = store_id.clone();
        let filter = filter.clone();
        Box::pin(async move {
            inner
                .read_userset_tuples(&ctx, &store_id, &filter, options)
                .await
        })
    })
}

fn starting_with_user_producer<R>(
    inner: &Arc<R>,
    ctx: &ReadContext,
    store_id: &str,
    filter: &ReadStartingWithUserFilter,
    options: ReadOptions,
) -> Producer<Tuple>
where
    R: RelationshipTupleReader + 'static,
{
    let inner = Arc::clone(inner);
    let ctx = ctx.detached();
    let store_id = store_id.to_string();
    let filter = filter.clone();
    Box::new(move || -> ProducerFuture<Tuple> {
        let inner = Arc::clone(&inner);
        let ctx = ctx.clone();
        let store_id = store_id.clone();
        let filter = filter.clone();
        Box::pin(async move {
            inner
                .read_starting_with_user(&ctx, &store_id, &filter, options)
                .await
        })
    })
}

#[async_trait]
impl<R> RelationshipTupleReader for SharedIteratorReader<R>
where
    R: RelationshipTupleReader + 'static,
{
    async fn read(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        if self.may_share(&options) {
            let key = self.keys.read_key(store_id, filter);
            let producer = read_producer(&self.inner, ctx, store_id, filter, options);
            if let Some(iter) = self
                .lookup(ctx, OperationKind::Read, key, producer)
                .await?
            {
                return Ok(iter);
            }
        }
        self.inner.read(ctx, store_id, filter, options).await
    }

    async fn read_userset_tuples(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadUsersetTuplesFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        if self.may_share(&options) {
            let key = self.keys.read_userset_tuples_key(store_id, filter);
            let producer = userset_producer(&self.inner, ctx, store_id, filter, options);
            if let Some(iter) = self
                .lookup(ctx, OperationKind::ReadUsersetTuples, key, producer)
                .await?
            {
                return Ok(iter);
            }
        }
        self.inner
            .read_userset_tuples(ctx, store_id, filter, options)
            .await
    }

    async fn read_starting_with_user(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadStartingWithUserFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        if self.may_share(&options) {
            let key = self.keys.read_starting_with_user_key(store_id, filter);
            let producer =
                starting_with_user_producer(&self.inner, ctx, store_id, filter, options);
            if let Some(iter) = self
                .lookup(ctx, OperationKind::ReadStartingWithUser, key, producer)
                .await?
            {
                return Ok(iter);
            }
        }
        self.inner
            .read_starting_with_user(ctx, store_id, filter, options)
            .await
    }

    async fn read_page(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadFilter,
        pagination: &Pagination,
        options: ReadOptions,
    ) -> StorageResult<(Vec<Tuple>, Option<String>)> {
        self.inner
            .read_page(ctx, store_id, filter, pagination, options)
            .await
    }

    async fn read_user_tuple(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        key: &TupleKey,
        options: ReadOptions,
    ) -> StorageResult<Tuple> {
        self.inner
            .read_user_tuple(ctx, store_id, key, options)
            .await
    }
}
