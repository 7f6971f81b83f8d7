//! One cached query: a lazily built shared root iterator plus the two timers
//! that evict it.
//!
//! The root is built at most once per entry, by whichever caller reaches the
//! entry first; concurrent callers wait for that build. A failed build is
//! kept and handed to every caller until the entry is removed from its map.
//!
//! Two timers race to evict a live entry. The admission timer caps total
//! lifetime; the idle timer fires once the entry has gone unused for the idle
//! window and is pushed back on every use. Whichever fires first flips the
//! entry to evicted, stops the root and removes the entry from its map. The
//! other finds the entry already evicted and does nothing.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tuplecache_core::{SharedIteratorConfig, StorageError, StorageIterator, StorageResult};

use crate::shared_iterator::SharedIterator;

/// Future returned by a [`Producer`].
pub type ProducerFuture<T> =
    Pin<Box<dyn Future<Output = StorageResult<Box<dyn StorageIterator<T>>>> + Send>>;

/// Calls the backend for one cached query. May be invoked again if a build is
/// abandoned part way through.
pub type Producer<T> = Box<dyn Fn() -> ProducerFuture<T> + Send + Sync>;

/// Removes an entry from whatever map holds it.
pub type Cleanup = Box<dyn Fn() + Send + Sync>;

/// Per-entry settings taken from [`SharedIteratorConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySettings {
    pub admission_timeout: Duration,
    pub idle_timeout: Duration,
    pub batch_size: usize,
    pub max_buffered: Option<usize>,
}

impl From<&SharedIteratorConfig> for EntrySettings {
    fn from(config: &SharedIteratorConfig) -> Self {
        Self {
            admission_timeout: config.admission_timeout,
            idle_timeout: config.idle_timeout,
            batch_size: config.batch_size,
            max_buffered: config.max_buffered_items,
        }
    }
}

/// Why an entry was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Admission,
    Idle,
    Shutdown,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::Admission => f.write_str("admission"),
            EvictionReason::Idle => f.write_str("idle"),
            EvictionReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Outcome of [`CacheEntry::unwrap`].
pub struct Unwrapped<T> {
    /// A fresh handle on the shared results, or `None` if the root was
    /// evicted and the caller must read the backend itself.
    pub iter: Option<SharedIterator<T>>,
    /// True if this call built the root.
    pub created: bool,
}

/// A lazily built, self-evicting shared iterator.
pub struct CacheEntry<T> {
    root: OnceCell<StorageResult<Mutex<SharedIterator<T>>>>,
    producer: Producer<T>,
    cleanup: Cleanup,
    settings: EntrySettings,
    evicted: AtomicBool,
    idle_deadline: Mutex<Instant>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> CacheEntry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(settings: EntrySettings, producer: Producer<T>, cleanup: Cleanup) -> Self {
        Self {
            root: OnceCell::new(),
            producer,
            cleanup,
            settings,
            evicted: AtomicBool::new(false),
            idle_deadline: Mutex::new(Instant::now() + settings.idle_timeout),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Hand out a new handle on this entry's results, building the root on
    /// first use.
    ///
    /// Errors from the build are returned unchanged, to this and every later
    /// caller. `Unwrapped::iter` is `None` when the root has already been
    /// evicted.
    pub async fn unwrap(self: &Arc<Self>) -> StorageResult<Unwrapped<T>> {
        let created = if self.root.initialized() {
            self.touch();
            false
        } else {
            // Built on its own task: a caller that gives up mid-build must
            // not leave the entry without a root or timers.
            let entry = Arc::clone(self);
            tokio::spawn(async move { entry.build().await })
                .await
                .map_err(|err| {
                    StorageError::query_failed(format!("shared iterator build: {err}"))
                })?
        };

        let root = match self.root.get() {
            Some(Ok(root)) => root,
            Some(Err(err)) => return Err(err.clone()),
            None => return Ok(Unwrapped { iter: None, created }),
        };

        let iter = root.lock().try_clone();
        Ok(Unwrapped { iter, created })
    }

    /// Run or join the root build. Returns true if this call ran the
    /// producer.
    async fn build(self: &Arc<Self>) -> bool {
        let built = AtomicBool::new(false);
        let built_ref = &built;
        let root = self
            .root
            .get_or_init(|| async move {
                built_ref.store(true, Ordering::SeqCst);
                let reader = (self.producer)().await?;
                Ok(Mutex::new(SharedIterator::new(
                    reader,
                    self.settings.batch_size,
                    self.settings.max_buffered,
                )))
            })
            .await;

        if !built.load(Ordering::SeqCst) {
            self.touch();
            return false;
        }

        match root {
            Ok(root) => {
                self.start_timers();
                if self.is_evicted() {
                    // Evicted while building; the eviction found no root to stop.
                    root.lock().stop();
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "shared iterator producer failed");
                self.discard();
            }
        }
        true
    }

    /// Push the idle deadline back to a full idle window from now.
    fn touch(&self) {
        *self.idle_deadline.lock() = Instant::now() + self.settings.idle_timeout;
    }

    fn idle_deadline(&self) -> Instant {
        *self.idle_deadline.lock()
    }

    fn start_timers(self: &Arc<Self>) {
        self.touch();

        let admission = {
            let entry = Arc::downgrade(self);
            let timeout = self.settings.admission_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(entry) = entry.upgrade() {
                    entry.evict(EvictionReason::Admission);
                }
            })
        };

        let idle = {
            let entry = Arc::downgrade(self);
            tokio::spawn(idle_timer(entry))
        };

        let mut timers = self.timers.lock();
        timers.push(admission);
        timers.push(idle);
        if self.is_evicted() {
            // An eviction that ran before the push could not abort these.
            for timer in timers.drain(..) {
                timer.abort();
            }
        }
    }

    /// Stop the root and remove this entry from its map, unless another
    /// eviction got there first.
    ///
    /// Returns true if this call performed the eviction.
    pub fn evict(&self, reason: EvictionReason) -> bool {
        if self.evicted.swap(true, Ordering::SeqCst) {
            return false;
        }

        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        if let Some(Ok(root)) = self.root.get() {
            root.lock().stop();
        }
        (self.cleanup)();

        tracing::debug!(reason = %reason, "evicted shared iterator entry");
        true
    }

    /// Remove this entry from its map without stopping anything. Used when
    /// the build failed. Safe to call more than once.
    pub fn discard(&self) {
        (self.cleanup)();
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }
}

impl<T> Drop for CacheEntry<T> {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain(..) {
            timer.abort();
        }
    }
}

/// Sleep until the entry's idle deadline, re-arming whenever a reuse moved
/// the deadline while we slept.
async fn idle_timer<T>(entry: Weak<CacheEntry<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    loop {
        let deadline = match entry.upgrade() {
            Some(entry) => entry.idle_deadline(),
            None => return,
        };
        tokio::time::sleep_until(deadline).await;

        let Some(entry) = entry.upgrade() else {
            return;
        };
        if Instant::now() >= entry.idle_deadline() {
            entry.evict(EvictionReason::Idle);
            return;
        }
    }
}
