//! tuplecache Storage - Shared Iterator Cache
//!
//! Deduplicates concurrent identical streaming reads against a relationship
//! tuple store. [`SharedIteratorReader`] wraps any
//! [`RelationshipTupleReader`](tuplecache_core::RelationshipTupleReader) and
//! exposes the same interface. Also ships [`MemoryTupleStore`], an in-memory
//! backend.

pub mod await_gate;
pub mod cache;
pub mod memory;
pub mod shared_iterator;
pub mod shared_reader;

pub use await_gate::AwaitGate;
pub use cache::{
    AdmissionControl, BypassReason, CacheEntry, CacheKey, EntryMap, EntrySettings,
    EvictionReason, KeyDeriver, Lookup, OperationKind, Sha256KeyDeriver,
};
pub use memory::MemoryTupleStore;
pub use shared_iterator::{IteratorState, SharedIterator};
pub use shared_reader::{SharedIteratorReader, SharedIteratorStats};
