//! In-memory relationship tuple store.
//!
//! Holds tuples per store in insertion order and answers every read by
//! scanning. Intended for tests and demos, and as the backend behind a
//! [`SharedIteratorReader`](crate::SharedIteratorReader) when nothing durable
//! is needed.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tuplecache_core::{
    Pagination, ReadContext, ReadFilter, ReadOptions, ReadStartingWithUserFilter,
    ReadUsersetTuplesFilter, RelationshipTupleReader, StaticIterator, StorageError,
    StorageResult, Tuple, TupleIterator, TupleKey,
};

/// Relationship tuples kept in memory, keyed by store id.
#[derive(Debug, Default)]
pub struct MemoryTupleStore {
    stores: DashMap<String, Vec<Tuple>>,
}

impl MemoryTupleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store. Creating an existing store is a no-op.
    pub fn create_store(&self, store_id: impl Into<String>) {
        self.stores.entry(store_id.into()).or_default();
    }

    /// Write tuples, creating the store if needed. A key that names an
    /// existing relationship replaces it.
    pub fn write(&self, store_id: &str, keys: impl IntoIterator<Item = TupleKey>) {
        let mut tuples = self.stores.entry(store_id.to_string()).or_default();
        for key in keys {
            let tuple = Tuple {
                key,
                timestamp: Utc::now(),
            };
            match tuples
                .iter_mut()
                .find(|existing| existing.key.same_relationship(&tuple.key))
            {
                Some(existing) => *existing = tuple,
                None => tuples.push(tuple),
            }
        }
    }

    /// Delete tuples. Returns how many were removed.
    pub fn delete(&self, store_id: &str, keys: &[TupleKey]) -> StorageResult<usize> {
        let mut tuples = self
            .stores
            .get_mut(store_id)
            .ok_or_else(|| store_not_found(store_id))?;
        let before = tuples.len();
        tuples.retain(|tuple| !keys.iter().any(|key| key.same_relationship(&tuple.key)));
        Ok(before - tuples.len())
    }

    pub fn tuple_count(&self, store_id: &str) -> usize {
        self.stores.get(store_id).map(|t| t.len()).unwrap_or(0)
    }

    fn select(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        predicate: impl Fn(&TupleKey) -> bool,
    ) -> StorageResult<Vec<Tuple>> {
        ctx.check()?;
        let tuples = self
            .stores
            .get(store_id)
            .ok_or_else(|| store_not_found(store_id))?;
        Ok(tuples
            .iter()
            .filter(|tuple| predicate(&tuple.key))
            .cloned()
            .collect())
    }
}

fn store_not_found(store_id: &str) -> StorageError {
    StorageError::StoreNotFound {
        store_id: store_id.to_string(),
    }
}

fn parse_offset(token: &str) -> StorageResult<usize> {
    token
        .parse()
        .map_err(|_| StorageError::InvalidContinuationToken {
            token: token.to_string(),
        })
}

#[async_trait]
impl RelationshipTupleReader for MemoryTupleStore {
    async fn read(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadFilter,
        _options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        let tuples = self.select(ctx, store_id, |key| filter.matches(key))?;
        Ok(Box::new(StaticIterator::new(tuples)))
    }

    async fn read_userset_tuples(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadUsersetTuplesFilter,
        _options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        if filter.object.is_empty() || filter.relation.is_empty() {
            return Err(StorageError::InvalidFilter {
                reason: "object and relation are required".to_string(),
            });
        }
        let tuples = self.select(ctx, store_id, |key| filter.matches(key))?;
        Ok(Box::new(StaticIterator::new(tuples)))
    }

    async fn read_starting_with_user(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadStartingWithUserFilter,
        _options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        if filter.object_type.is_empty() || filter.relation.is_empty() {
            return Err(StorageError::InvalidFilter {
                reason: "object type and relation are required".to_string(),
            });
        }
        let tuples = self.select(ctx, store_id, |key| filter.matches(key))?;
        Ok(Box::new(StaticIterator::new(tuples)))
    }

    async fn read_page(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadFilter,
        pagination: &Pagination,
        _options: ReadOptions,
    ) -> StorageResult<(Vec<Tuple>, Option<String>)> {
        let offset = match &pagination.from {
            Some(token) => parse_offset(token)?,
            None => 0,
        };
        let matching = self.select(ctx, store_id, |key| filter.matches(key))?;
        let page_size = pagination.page_size.max(1);

        let page: Vec<Tuple> = matching.iter().skip(offset).take(page_size).cloned().collect();
        let next = offset + page.len();
        let token = (next < matching.len()).then(|| next.to_string());
        Ok((page, token))
    }

    async fn read_user_tuple(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        key: &TupleKey,
        _options: ReadOptions,
    ) -> StorageResult<Tuple> {
        self.select(ctx, store_id, |candidate| candidate.same_relationship(key))?
            .into_iter()
            .next()
            .ok_or(StorageError::NotFound)
    }
}
