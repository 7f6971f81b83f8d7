//! The relationship tuple read interface.
//!
//! Backends implement it; the shared iterator cache both consumes and exposes
//! it, so a cached reader can be dropped in wherever a backend is expected.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ReadContext;
use crate::error::StorageResult;
use crate::iterator::TupleIterator;
use crate::tuple::{
    Pagination, ReadFilter, ReadOptions, ReadStartingWithUserFilter, ReadUsersetTuplesFilter,
    Tuple, TupleKey,
};

/// Read side of a relationship tuple store.
#[async_trait]
pub trait RelationshipTupleReader: Send + Sync {
    // ========================================================================
    // STREAMING READS
    // ========================================================================

    /// All tuples matching `filter`.
    async fn read(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator>;

    /// Userset and wildcard tuples on one object and relation.
    async fn read_userset_tuples(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadUsersetTuplesFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator>;

    /// Tuples of one object type and relation whose user is in the filter.
    async fn read_starting_with_user(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadStartingWithUserFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator>;

    // ========================================================================
    // BOUNDED READS
    // ========================================================================

    /// One page of tuples matching `filter` and the token for the next page.
    async fn read_page(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadFilter,
        pagination: &Pagination,
        options: ReadOptions,
    ) -> StorageResult<(Vec<Tuple>, Option<String>)>;

    /// The tuple with exactly this object, relation and user.
    async fn read_user_tuple(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        key: &TupleKey,
        options: ReadOptions,
    ) -> StorageResult<Tuple>;
}

#[async_trait]
impl<R> RelationshipTupleReader for Arc<R>
where
    R: RelationshipTupleReader + ?Sized,
{
    async fn read(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        (**self).read(ctx, store_id, filter, options).await
    }

    async fn read_userset_tuples(
        &self,
        ctx: &ReadContext,
        store_id: &str,
        filter: &ReadUsersetTuplesFilter,
        options: ReadOptions,
    ) -> StorageResult<TupleIterator> {
        (**self)
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
        (**self)
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
        (**self)
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
        (**self).read_user_tuple(ctx, store_id, key, options).await
    }
}
