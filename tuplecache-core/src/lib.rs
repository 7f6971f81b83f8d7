//! tuplecache Core - Tuple Types and Backend Seams
//!
//! Plain data types, the read context, the iterator and reader traits, and
//! configuration. All other crates depend on this. No caching behavior lives
//! here.

pub mod config;
pub mod context;
pub mod error;
pub mod iterator;
pub mod reader;
pub mod tuple;

pub use config::{
    SharedIteratorConfig, DEFAULT_ADMISSION_TIMEOUT_MS, DEFAULT_BATCH_SIZE,
    DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_SHARED_ITERATOR_LIMIT,
};
pub use context::{CancelHandle, ReadContext};
pub use error::{ConfigError, StorageError, StorageResult, TupleCacheError, TupleCacheResult};
pub use iterator::{collect, StaticIterator, StorageIterator, TupleIterator};
pub use reader::RelationshipTupleReader;
pub use tuple::{
    is_wildcard, object_id, object_type, split_user, Consistency, ObjectRelation, Pagination,
    ReadFilter, ReadOptions, ReadStartingWithUserFilter, ReadUsersetTuplesFilter,
    RelationReference, RelationshipCondition, Tuple, TupleKey,
};
