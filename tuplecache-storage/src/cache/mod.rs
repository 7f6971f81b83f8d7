//! Entry cache behind the shared iterator reader.
//!
//! Each distinct query maps to one [`CacheEntry`] holding a shared root
//! iterator. Entries are created on demand, counted against a global limit by
//! [`AdmissionControl`], and evicted by their own timers.
//!
//! # Identity-guarded removal
//!
//! An entry only ever removes itself: its cleanup deletes the map slot if and
//! only if the slot still holds that same entry. A newer entry inserted under
//! the same key after an eviction is never removed, and the live count is only
//! decremented for a removal that actually happened.
//!
//! # Example
//!
//! ```ignore
//! let admission = Arc::new(AdmissionControl::new(config.limit));
//! let reads = EntryMap::new(admission, EntrySettings::from(&config));
//!
//! match reads.acquire(key, producer).await? {
//!     Lookup::Shared { iter, .. } => Ok(Box::new(iter)),
//!     Lookup::Bypass(_) => backend.read(ctx, store_id, filter, options).await,
//! }
//! ```

pub mod entry;
pub mod key;
pub mod map;

pub use entry::{
    CacheEntry, Cleanup, EntrySettings, EvictionReason, Producer, ProducerFuture, Unwrapped,
};
pub use key::{CacheKey, KeyDeriver, OperationKind, Sha256KeyDeriver};
pub use map::{AdmissionControl, BypassReason, EntryMap, Lookup};
