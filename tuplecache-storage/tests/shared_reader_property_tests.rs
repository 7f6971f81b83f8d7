//! Property-Based Tests for Shared Reads
//!
//! For any stored tuples and any read filter, every caller of a shared read
//! observes exactly the tuples a direct read of the backend returns, in the
//! same order, however many callers share the entry.

use std::sync::Arc;

use proptest::prelude::*;
use tuplecache_core::{
    collect, ReadContext, ReadFilter, ReadOptions, RelationshipTupleReader, SharedIteratorConfig,
    TupleKey,
};
use tuplecache_storage::{MemoryTupleStore, SharedIterator, SharedIteratorReader};
use tuplecache_test_utils::fixtures::STORE_ID;
use tuplecache_test_utils::generators::{arb_read_filter, arb_read_options, arb_tuple_key};
use tuplecache_test_utils::StaticIterator;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn keys_of<R: RelationshipTupleReader>(
    reader: &R,
    filter: &ReadFilter,
    options: ReadOptions,
) -> Vec<TupleKey> {
    let ctx = ReadContext::background();
    let mut iter = reader.read(&ctx, STORE_ID, filter, options).await.unwrap();
    collect(&mut iter, &ctx)
        .await
        .unwrap()
        .into_iter()
        .map(|tuple| tuple.key)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: shared results are identical to direct results.
    #[test]
    fn prop_shared_read_matches_direct_read(
        keys in prop::collection::vec(arb_tuple_key(), 0..40),
        filter in arb_read_filter(),
        options in arb_read_options(),
        batch_size in 1usize..8,
        callers in 1usize..5,
    ) {
        let rt = runtime();
        let (direct, shared) = rt.block_on(async {
            let store = Arc::new(MemoryTupleStore::new());
            store.write(STORE_ID, keys);

            let reader = Arc::new(
                SharedIteratorReader::from_arc(
                    Arc::clone(&store),
                    SharedIteratorConfig::default().with_batch_size(batch_size),
                )
                .unwrap(),
            );

            let direct = keys_of(&*store, &filter, options).await;

            let mut handles = Vec::new();
            for _ in 0..callers {
                let reader = Arc::clone(&reader);
                let filter = filter.clone();
                handles.push(tokio::spawn(async move {
                    keys_of(&*reader, &filter, options).await
                }));
            }
            let mut shared = Vec::new();
            for handle in handles {
                shared.push(handle.await.unwrap());
            }
            reader.close();
            (direct, shared)
        });

        for result in shared {
            prop_assert_eq!(&result, &direct);
        }
    }

    /// Property: clones taken at any point each see the full sequence from
    /// the start, regardless of how far other clones have advanced.
    #[test]
    fn prop_clones_are_independent(
        len in 0u32..60,
        batch_size in 1usize..10,
        advance in prop::collection::vec(0usize..70, 1..5),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let ctx = ReadContext::background();
            let expected: Vec<u32> = (0..len).collect();
            let root = SharedIterator::new(
                Box::new(StaticIterator::new(expected.clone())),
                batch_size,
                None,
            );

            let mut clones = Vec::new();
            for steps in &advance {
                let mut clone = root.try_clone().unwrap();
                for _ in 0..*steps {
                    if clone.next(&ctx).await.is_err() {
                        break;
                    }
                }
                clones.push(clone);
            }

            let mut late = root.try_clone().unwrap();
            let seen = collect(&mut late, &ctx).await.unwrap();
            prop_assert_eq!(&seen, &expected);

            for (clone, steps) in clones.iter_mut().zip(&advance) {
                let rest = collect(clone, &ctx).await.unwrap();
                let skipped = (*steps).min(expected.len());
                prop_assert_eq!(&rest[..], &expected[skipped..]);
            }
            Ok(())
        })?;
    }
}
