//! Sequential, context-aware result iterators returned by backends.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::context::ReadContext;
use crate::error::{StorageError, StorageResult};
use crate::tuple::Tuple;

/// A sequential iterator over backend results.
///
/// `next` returns [`StorageError::IteratorDone`] once the results are
/// exhausted. `stop` releases backend resources and must be safe to call more
/// than once.
#[async_trait]
pub trait StorageIterator<T>: Send {
    async fn next(&mut self, ctx: &ReadContext) -> StorageResult<T>;

    fn stop(&mut self);
}

/// Iterator over relationship tuples, as produced by every read operation.
pub type TupleIterator = Box<dyn StorageIterator<Tuple>>;

#[async_trait]
impl<T: Send> StorageIterator<T> for Box<dyn StorageIterator<T>> {
    async fn next(&mut self, ctx: &ReadContext) -> StorageResult<T> {
        (**self).next(ctx).await
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

/// Iterator over results that were materialized up front.
#[derive(Debug, Clone)]
pub struct StaticIterator<T> {
    items: VecDeque<T>,
    stopped: bool,
}

impl<T> StaticIterator<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
            stopped: false,
        }
    }

    /// Items not yet returned.
    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl<T: Send> StorageIterator<T> for StaticIterator<T> {
    async fn next(&mut self, ctx: &ReadContext) -> StorageResult<T> {
        ctx.check()?;
        if self.stopped {
            return Err(StorageError::IteratorDone);
        }
        self.items.pop_front().ok_or(StorageError::IteratorDone)
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.items.clear();
    }
}

/// Drain an iterator into a vector, stopping it afterwards.
pub async fn collect<T, I>(iter: &mut I, ctx: &ReadContext) -> StorageResult<Vec<T>>
where
    I: StorageIterator<T> + ?Sized,
{
    let mut out = Vec::new();
    let result = loop {
        match iter.next(ctx).await {
            Ok(item) => out.push(item),
            Err(StorageError::IteratorDone) => break Ok(out),
            Err(err) => break Err(err),
        }
    };
    iter.stop();
    result
}
