//! tuplecache Test Utilities
//!
//! Centralized test infrastructure for the tuplecache workspace:
//! - Instrumented backends that count calls and iterator releases
//! - Scripted iterators and readers with injectable failures and delays
//! - Proptest generators for tuples, filters and options
//! - Fixtures for common scenarios

pub use tuplecache_core::{
    collect, Consistency, ObjectRelation, Pagination, ReadContext, ReadFilter, ReadOptions,
    ReadStartingWithUserFilter, ReadUsersetTuplesFilter, RelationReference,
    RelationshipTupleReader, StaticIterator, StorageError, StorageIterator, StorageResult, Tuple,
    TupleIterator, TupleKey,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// ITERATOR PROBES
// ============================================================================

/// Counters shared by every iterator handed out under one probe.
#[derive(Debug, Default)]
pub struct IteratorProbe {
    next_calls: AtomicUsize,
    items_yielded: AtomicUsize,
    stop_calls: AtomicUsize,
    iterators_created: AtomicUsize,
}

impl IteratorProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Calls to `next` on the underlying iterators.
    pub fn next_calls(&self) -> usize {
        self.next_calls.load(Ordering::SeqCst)
    }

    /// Items successfully returned by the underlying iterators.
    pub fn items_yielded(&self) -> usize {
        self.items_yielded.load(Ordering::SeqCst)
    }

    /// Calls to `stop`, counting repeats.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn iterators_created(&self) -> usize {
        self.iterators_created.load(Ordering::SeqCst)
    }
}

/// Wraps an iterator and reports its activity to an [`IteratorProbe`].
pub struct ProbedIterator<I> {
    inner: I,
    probe: Arc<IteratorProbe>,
}

impl<I> ProbedIterator<I> {
    pub fn new(inner: I, probe: Arc<IteratorProbe>) -> Self {
        probe.iterators_created.fetch_add(1, Ordering::SeqCst);
        Self { inner, probe }
    }
}

#[async_trait]
impl<T, I> StorageIterator<T> for ProbedIterator<I>
where
    T: Send,
    I: StorageIterator<T>,
{
    async fn next(&mut self, ctx: &ReadContext) -> StorageResult<T> {
        self.probe.next_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.next(ctx).await;
        if result.is_ok() {
            self.probe.items_yielded.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    fn stop(&mut self) {
        self.probe.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.stop();
    }
}

// ============================================================================
// SCRIPTED ITERATOR
// ============================================================================

/// Iterator that yields a fixed list of items and then a chosen terminal
/// error, optionally sleeping before each item.
#[derive(Debug)]
pub struct ScriptedIterator<T> {
    items: VecDeque<T>,
    terminal: StorageError,
    item_delay: Option<Duration>,
}

impl<T> ScriptedIterator<T> {
    /// Yields `items`, then [`StorageError::IteratorDone`].
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
            terminal: StorageError::IteratorDone,
            item_delay: None,
        }
    }

    /// End with `terminal` instead of `IteratorDone`.
    pub fn failing_with(mut self, terminal: StorageError) -> Self {
        self.terminal = terminal;
        self
    }

    /// Sleep for `delay` before returning each item.
    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = Some(delay);
        self
    }
}

#[async_trait]
impl<T: Send> StorageIterator<T> for ScriptedIterator<T> {
    async fn next(&mut self, _ctx: &ReadContext) -> StorageResult<T> {
        if let Some(delay) = self.item_delay {
            tokio::time::sleep(delay).await;
        }
        self.items.pop_front().ok_or_else(|| self.terminal.clone())
    }

    fn stop(&mut self) {
        self.items.clear();
    }
}

// ============================================================================
// COUNTING READER
// ============================================================================

/// Per-operation call counters for a [`CountingReader`].
#[derive(Debug, Default)]
pub struct ReadCounters {
    read: AtomicUsize,
    read_userset_tuples: AtomicUsize,
    read_starting_with_user: AtomicUsize,
    read_page: AtomicUsize,
    read_user_tuple: AtomicUsize,
}

impl ReadCounters {
    pub fn read(&self) -> usize {
        self.read.load(Ordering::SeqCst)
    }

    pub fn read_userset_tuples(&self) -> usize {
        self.read_userset_tuples.load(Ordering::SeqCst)
    }

    pub fn read_starting_with_user(&self) -> usize {
        self.read_starting_with_user.load(Ordering::SeqCst)
    }

    pub fn read_page(&self) -> usize {
        self.read_page.load(Ordering::SeqCst)
    }

    pub fn read_user_tuple(&self) -> usize {
        self.read_user_tuple.load(Ordering::SeqCst)
    }

    /// Calls to the three streaming operations.
    pub fn streaming_total(&self) -> usize {
        self.read() + self.read_userset_tuples() + self.read_starting_with_user()
    }
}

/// Wraps a reader, counting calls and probing every iterator it returns.
pub struct CountingReader<R> {
    inner: R,
    counters: Arc<ReadCounters>,
    probe: Arc<IteratorProbe>,
    construction_delay: Option<Duration>,
}

impl<R: RelationshipTupleReader> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            counters: Arc::new(ReadCounters::default()),
            probe: IteratorProbe::new(),
            construction_delay: None,
        }
    }

    /// Sleep for `delay` before every streaming read returns, widening the
    /// window in which concurrent callers overlap.
    pub fn with_construction_delay(mut self, delay: Duration) -> Self {
        self.construction_delay = Some(delay);
        self
    }

    pub fn counters(&self) -> Arc<ReadCounters> {
        Arc::clone(&self.counters)
    }

    pub fn probe(&self) -> Arc<IteratorProbe> {
        Arc::clone(&self.probe)
    }

    async fn delay(&self) {
        if let Some(delay) = self.construction_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn wrap(&self, iter: TupleIterator) -> TupleIterator {
        Box::new(ProbedIterator::new(iter, Arc::clone(&self.probe)))
    }
}

#[async_trait]
impl<R: RelationshipTupleReader> RelationshipTupleReader for CountingReader<R> {
    async fn read(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        self.counters.read.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let iter = self.inner.read(ctx, store_id, filter, options).await?;
        Ok(self.wrap(iter))
    }

    async fn read_userset_tuples(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadUsersetTuplesFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        self.counters
            .read_userset_tuples
            .fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let iter = self
            .inner
            .read_userset_tuples(ctx, store_id, filter, options)
            .await?;
        Ok(self.wrap(iter))
    }

    async fn read_starting_with_user(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadStartingWithUserFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        self.counters
            .read_starting_with_user
            .fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let iter = self
            .inner
            .read_starting_with_user(ctx, store_id, filter, options)
            .await?;
        Ok(self.wrap(iter))
    }

    async fn read_page(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadFilter,
        pagination: &Pagination,
        options: ReadOptions,
    ) -> StorageResult<(Vec<Tuple>, Option<String>)> {
        self.counters.read_page.fetch_add(1, Ordering::SeqCst);
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
        self.counters.read_user_tuple.fetch_add(1, Ordering::SeqCst);
        self.inner.read_user_tuple(ctx, store_id, key, options).await
    }
}

// ============================================================================
// SCRIPTED READER
// ============================================================================

/// Reader whose streaming operations all return the same scripted stream,
/// regardless of filter. Construction can be made to fail a number of times
/// before succeeding.
pub struct ScriptedReader {
    tuples: Vec<Tuple>,
    terminal: StorageError,
    item_delay: Option<Duration>,
    construction_failures: Mutex<VecDeque<StorageError>>,
}

impl ScriptedReader {
    pub fn new(tuples: Vec<Tuple>) -> Self {
        Self {
            tuples,
            terminal: StorageError::IteratorDone,
            item_delay: None,
            construction_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// End every stream with `terminal` after the scripted tuples.
    pub fn failing_with(mut self, terminal: StorageError) -> Self {
        self.terminal = terminal;
        self
    }

    pub fn with_item_delay(mut self, delay: Duration) -> Self {
        self.item_delay = Some(delay);
        self
    }

    /// Fail the next streaming read with `err`. Queued failures are consumed
    /// in order, one per call.
    pub fn fail_next_construction(self, err: StorageError) -> Self {
        self.construction_failures.lock().push_back(err);
        self
    }

    fn stream(&self) -> StorageResult<TupleIterator> {
        if let Some(err) = self.construction_failures.lock().pop_front() {
            return Err(err);
        }
        let mut iter =
            ScriptedIterator::new(self.tuples.clone()).failing_with(self.terminal.clone());
        if let Some(delay) = self.item_delay {
            iter = iter.with_item_delay(delay);
        }
        Ok(Box::new(iter))
    }
}

#[async_trait]
impl RelationshipTupleReader for ScriptedReader {
    async fn read(
        &self,
        _ctx: &ReadContext,
        _store_id: &str,
        _filter: &ReadFilter,
        _options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        self.stream()
    }

    async fn read_userset_tuples(
        &self,
        _ctx: &ReadContext,
        _store_id: &str,
        _filter: &ReadUsersetTuplesFilter,
        _options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        self.stream()
    }

    async fn read_starting_with_user(
        &self,
        _ctx: &ReadContext,
        _store_id: &str,
        _filter: &ReadStartingWithUserFilter,
        _options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        self.stream()
    }

    async fn read_page(
        &self,
        _ctx: &ReadContext,
        _store_id: &str,
        _filter: &ReadFilter,
        pagination: &Pagination,
        _options: ReadOptions,
    ) -> StorageResult<(Vec<Tuple>, Option<String>)> {
        let page = self
            .tuples
            .iter()
            .take(pagination.page_size)
            .cloned()
            .collect();
        Ok((page, None))
    }

    async fn read_user_tuple(
        &self,
        _ctx: &ReadContext,
        _store_id: &str,
        key: &TupleKey,
        _options: ReadOptions,
    ) -> StorageResult<Tuple> {
        self.tuples
            .iter()
            .find(|tuple| tuple.key.same_relationship(key))
            .cloned()
            .ok_or(StorageError::NotFound)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made tuples for common scenarios.

    use super::*;

    pub const STORE_ID: &str = "01HVMMBCMGZNT3SED4Z17ECXCA";

    /// `document:<doc>#viewer@user:u<i>` for `i` in `0..count`.
    pub fn document_viewers(doc: &str, count: usize) -> Vec<TupleKey> {
        (0..count)
            .map(|i| TupleKey::new(format!("document:{doc}"), "viewer", format!("user:u{i}")))
            .collect()
    }

    /// Same as [`document_viewers`], stamped as stored tuples.
    pub fn document_viewer_tuples(doc: &str, count: usize) -> Vec<Tuple> {
        document_viewers(doc, count)
            .into_iter()
            .map(Tuple::new)
            .collect()
    }

    /// A filter matching every viewer of `document:<doc>`.
    pub fn viewers_of(doc: &str) -> ReadFilter {
        ReadFilter::new(format!("document:{doc}"), "viewer", "")
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for tuples, filters and read options.

    use super::*;
    use proptest::prelude::*;

    /// Generate an object type name.
    pub fn arb_object_type() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("document".to_string()),
            Just("folder".to_string()),
            Just("group".to_string()),
            Just("user".to_string()),
        ]
    }

    /// Generate a `type:id` object.
    pub fn arb_object() -> impl Strategy<Value = String> {
        (arb_object_type(), "[a-z0-9]{1,6}").prop_map(|(t, id)| format!("{t}:{id}"))
    }

    /// Generate a relation name.
    pub fn arb_relation() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("viewer".to_string()),
            Just("editor".to_string()),
            Just("owner".to_string()),
            Just("member".to_string()),
        ]
    }

    /// Generate a concrete user, a userset or a wildcard.
    pub fn arb_user() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z]{1,6}".prop_map(|id| format!("user:{id}")),
            (arb_object(), arb_relation()).prop_map(|(o, r)| format!("{o}#{r}")),
            Just("user:*".to_string()),
        ]
    }

    /// Generate a TupleKey without a condition.
    pub fn arb_tuple_key() -> impl Strategy<Value = TupleKey> {
        (arb_object(), arb_relation(), arb_user())
            .prop_map(|(object, relation, user)| TupleKey::new(object, relation, user))
    }

    /// Generate a stored Tuple.
    pub fn arb_tuple() -> impl Strategy<Value = Tuple> {
        arb_tuple_key().prop_map(Tuple::new)
    }

    /// Generate a ReadFilter with any subset of fields set.
    pub fn arb_read_filter() -> impl Strategy<Value = ReadFilter> {
        (
            prop_oneof![
                Just(String::new()),
                arb_object_type().prop_map(|t| format!("{t}:")),
                arb_object(),
            ],
            prop_oneof![Just(String::new()), arb_relation()],
            prop_oneof![Just(String::new()), arb_user()],
        )
            .prop_map(|(object, relation, user)| ReadFilter {
                object,
                relation,
                user,
            })
    }

    /// Generate a RelationReference.
    pub fn arb_relation_reference() -> impl Strategy<Value = RelationReference> {
        prop_oneof![
            arb_object_type().prop_map(RelationReference::direct),
            (arb_object_type(), arb_relation())
                .prop_map(|(t, r)| RelationReference::userset(t, r)),
            arb_object_type().prop_map(RelationReference::wildcard),
        ]
    }

    /// Generate a ReadUsersetTuplesFilter.
    pub fn arb_userset_filter() -> impl Strategy<Value = ReadUsersetTuplesFilter> {
        (
            arb_object(),
            arb_relation(),
            prop::collection::vec(arb_relation_reference(), 0..4),
        )
            .prop_map(
                |(object, relation, allowed_user_type_restrictions)| ReadUsersetTuplesFilter {
                    object,
                    relation,
                    allowed_user_type_restrictions,
                },
            )
    }

    /// Generate a Consistency variant.
    pub fn arb_consistency() -> impl Strategy<Value = Consistency> {
        prop_oneof![
            Just(Consistency::Unspecified),
            Just(Consistency::MinimizeLatency),
            Just(Consistency::HigherConsistency),
        ]
    }

    /// Generate ReadOptions.
    pub fn arb_read_options() -> impl Strategy<Value = ReadOptions> {
        arb_consistency().prop_map(|consistency| ReadOptions { consistency })
    }
}
