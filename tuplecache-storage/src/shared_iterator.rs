//! Reference-counted iterator shared between concurrent readers.
//!
//! A root [`SharedIterator`] wraps one backend iterator. Clones share the
//! buffered results, the reference count and the backend iterator, but each
//! clone owns its own read cursor, so readers can consume the same results at
//! different speeds without interfering.
//!
//! Buffered results live in an immutable [`IteratorState`] snapshot behind an
//! atomic pointer. Readers load the snapshot once per access and never block
//! each other while the items they need are already buffered. When a reader
//! runs past the buffer, one fetch at a time appends the next batch by
//! publishing a new snapshot; every other reader that needs more waits on
//! that fetch through the [`AwaitGate`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tuplecache_core::{ReadContext, StorageError, StorageIterator, StorageResult};

use crate::await_gate::AwaitGate;

/// Immutable snapshot of everything fetched so far.
///
/// Items are stored in batches. Every batch except the last holds exactly
/// `batch_size` items; a short batch is only ever appended together with a
/// terminal error, after which the state never changes.
#[derive(Debug)]
pub struct IteratorState<T> {
    batches: Vec<Arc<[T]>>,
    batch_size: usize,
    len: usize,
    terminal: Option<StorageError>,
}

impl<T> IteratorState<T> {
    fn empty(batch_size: usize) -> Self {
        Self {
            batches: Vec::new(),
            batch_size,
            len: 0,
            terminal: None,
        }
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The error or end-of-stream marker that ended the stream, if any.
    pub fn terminal(&self) -> Option<&StorageError> {
        self.terminal.as_ref()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.batches
            .get(index / self.batch_size)
            .and_then(|batch| batch.get(index % self.batch_size))
    }

    /// A new snapshot with `batch` appended. Batches share storage with
    /// `self`, so this copies pointers, not items.
    fn extend(&self, batch: Vec<T>, terminal: Option<StorageError>) -> Self {
        let mut batches = self.batches.clone();
        let added = batch.len();
        if added > 0 {
            batches.push(Arc::from(batch));
        }
        Self {
            batches,
            batch_size: self.batch_size,
            len: self.len + added,
            terminal: self.terminal.clone().or(terminal),
        }
    }
}

/// State common to a root and all of its clones.
struct Shared<T> {
    state: ArcSwap<IteratorState<T>>,
    refs: AtomicUsize,
    gate: AwaitGate,
    reader: tokio::sync::Mutex<Option<Box<dyn StorageIterator<T>>>>,
    released: AtomicBool,
    batch_size: usize,
    max_buffered: Option<usize>,
}

impl<T> Shared<T> {
    /// Stop the backend iterator. Safe to call repeatedly and concurrently;
    /// the backend iterator is stopped exactly once.
    fn release_reader(&self) {
        self.released.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.reader.try_lock() {
            if let Some(mut reader) = guard.take() {
                reader.stop();
                tracing::trace!("shared iterator released backend iterator");
            }
        }
    }
}

impl<T> Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Pull the next batch from the backend and publish it.
    ///
    /// `seen` is the buffered length the caller observed. If the buffer has
    /// grown since then another fetch already served the caller.
    async fn fetch_more(&self, seen: usize) {
        let current = self.state.load_full();
        if current.len() > seen || current.terminal().is_some() {
            return;
        }

        let mut guard = self.reader.lock().await;
        let ctx = ReadContext::background();
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut terminal = None;

        match guard.as_mut() {
            Some(reader) => {
                while batch.len() < self.batch_size {
                    match reader.next(&ctx).await {
                        Ok(item) => batch.push(item),
                        Err(err) => {
                            terminal = Some(err);
                            break;
                        }
                    }
                }
            }
            None => terminal = Some(StorageError::IteratorDone),
        }

        tracing::trace!(
            fetched = batch.len(),
            buffered = current.len() + batch.len(),
            finished = terminal.is_some(),
            "shared iterator fetched batch"
        );

        self.state.store(Arc::new(current.extend(batch, terminal)));
        drop(guard);

        // A release that raced with this fetch could not take the reader.
        if self.released.load(Ordering::SeqCst) {
            self.release_reader();
        }
    }
}

/// One reader's handle onto a shared backend iterator.
///
/// `head` and `next` take `&mut self`: a handle belongs to one consumer at a
/// time. Hand other consumers their own handle via [`SharedIterator::try_clone`].
pub struct SharedIterator<T> {
    shared: Arc<Shared<T>>,
    head: usize,
    stopped: bool,
}

impl<T> SharedIterator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap `reader` in a new root with a reference count of one.
    pub fn new(
        reader: Box<dyn StorageIterator<T>>,
        batch_size: usize,
        max_buffered: Option<usize>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let shared = Shared {
            state: ArcSwap::from_pointee(IteratorState::empty(batch_size)),
            refs: AtomicUsize::new(1),
            gate: AwaitGate::new(),
            reader: tokio::sync::Mutex::new(Some(reader)),
            released: AtomicBool::new(false),
            batch_size,
            max_buffered,
        };
        Self {
            shared: Arc::new(shared),
            head: 0,
            stopped: false,
        }
    }

    /// The item under this handle's cursor, without advancing it.
    pub async fn head(&mut self, ctx: &ReadContext) -> StorageResult<T> {
        loop {
            ctx.check()?;
            if self.stopped {
                return Err(StorageError::IteratorDone);
            }

            let seen = {
                let state = self.shared.state.load();
                if let Some(item) = state.get(self.head) {
                    return Ok(item.clone());
                }
                if let Some(err) = state.terminal() {
                    return Err(err.clone());
                }
                state.len()
            };

            self.await_fetch(ctx, seen).await?;
        }
    }

    /// The item under this handle's cursor, advancing past it.
    pub async fn next(&mut self, ctx: &ReadContext) -> StorageResult<T> {
        let item = self.head(ctx).await?;
        self.head += 1;
        Ok(item)
    }

    /// Wait until the buffer has grown past `seen` or the stream has ended.
    ///
    /// The fetch itself runs on a detached task so a caller whose context
    /// expires mid-fetch never abandons a half-read batch.
    async fn await_fetch(&self, ctx: &ReadContext, seen: usize) -> StorageResult<()> {
        let shared = Arc::clone(&self.shared);
        let fetch = tokio::spawn(async move {
            shared.gate.run(|| shared.fetch_more(seen)).await;
        });

        tokio::select! {
            joined = fetch => joined.map_err(|e| {
                StorageError::query_failed(format!("shared iterator fetch aborted: {e}"))
            }),
            err = ctx.done() => Err(err),
        }
    }

    /// A new handle over the same results with its cursor at the start.
    ///
    /// Returns `None` if this handle is stopped, the backend iterator has been
    /// released, or the buffer has outgrown the configured bound. Callers
    /// should fall back to reading the backend directly.
    pub fn try_clone(&self) -> Option<Self> {
        if self.stopped || self.shared.released.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(max) = self.shared.max_buffered {
            if self.shared.state.load().len() > max {
                return None;
            }
        }
        self.shared.refs.fetch_add(1, Ordering::AcqRel);
        Some(Self {
            shared: Arc::clone(&self.shared),
            head: 0,
            stopped: false,
        })
    }

    /// Number of live handles sharing this backend iterator.
    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    /// Number of items buffered so far.
    pub fn buffered(&self) -> usize {
        self.shared.state.load().len()
    }
}

impl<T> SharedIterator<T> {
    /// Release this handle. The backend iterator is stopped once the last
    /// handle is released. Further calls are no-ops.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if self.shared.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.release_reader();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl<T> Drop for SharedIterator<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl<T> StorageIterator<T> for SharedIterator<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn next(&mut self, ctx: &ReadContext) -> StorageResult<T> {
        SharedIterator::next(self, ctx).await
    }

    fn stop(&mut self) {
        SharedIterator::stop(self)
    }
}
