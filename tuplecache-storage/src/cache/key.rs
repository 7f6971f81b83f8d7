//! Cache keys for shared iterator entries.
//!
//! A key is a hex-encoded SHA-256 digest of a canonical rendering of the
//! query: operation kind, store id and every filter field that changes the
//! result set. Every field is length-prefixed and every list is preceded by
//! its element count, so no two distinct queries render to the same bytes.
//! Set-valued fields are sorted before rendering so that the same set in a
//! different order yields the same key. Read options are not part of the key;
//! a read that must not share results never reaches the key deriver.

use std::fmt;

use sha2::{Digest, Sha256};
use tuplecache_core::{ReadFilter, ReadStartingWithUserFilter, ReadUsersetTuplesFilter};

/// The streaming read operations that can share iterators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    ReadUsersetTuples,
    ReadStartingWithUser,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Read,
        OperationKind::ReadUsersetTuples,
        OperationKind::ReadStartingWithUser,
    ];

    /// Prefix rendered into every key of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "r",
            OperationKind::ReadUsersetTuples => "rut",
            OperationKind::ReadStartingWithUser => "rtwu",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque, deterministic identifier of one query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap a precomputed key.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives cache keys for each cached operation kind.
///
/// Equal queries must produce equal keys. Distinct queries should not
/// collide; a collision would make one query observe another's results.
pub trait KeyDeriver: Send + Sync {
    fn read_key(&self, store_id: &str, filter: &ReadFilter) -> CacheKey;

    fn read_userset_tuples_key(&self, store_id: &str, filter: &ReadUsersetTuplesFilter)
        -> CacheKey;

    fn read_starting_with_user_key(
        &self,
        store_id: &str,
        filter: &ReadStartingWithUserFilter,
    ) -> CacheKey;
}

/// Default [`KeyDeriver`]: SHA-256 over a canonical field rendering.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256KeyDeriver;

impl Sha256KeyDeriver {
    fn digest<'a>(kind: OperationKind, fields: impl IntoIterator<Item = &'a str>) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        for field in fields {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        CacheKey(hex::encode(hasher.finalize()))
    }
}

impl KeyDeriver for Sha256KeyDeriver {
    fn read_key(&self, store_id: &str, filter: &ReadFilter) -> CacheKey {
        Self::digest(
            OperationKind::Read,
            [
                store_id,
                filter.object.as_str(),
                filter.relation.as_str(),
                filter.user.as_str(),
            ],
        )
    }

    fn read_userset_tuples_key(
        &self,
        store_id: &str,
        filter: &ReadUsersetTuplesFilter,
    ) -> CacheKey {
        let mut restrictions: Vec<String> = filter
            .allowed_user_type_restrictions
            .iter()
            .map(|reference| reference.to_string())
            .collect();
        restrictions.sort();
        restrictions.dedup();

        let count = restrictions.len().to_string();
        let mut fields = vec![
            store_id,
            filter.object.as_str(),
            filter.relation.as_str(),
            count.as_str(),
        ];
        fields.extend(restrictions.iter().map(String::as_str));
        Self::digest(OperationKind::ReadUsersetTuples, fields)
    }

    fn read_starting_with_user_key(
        &self,
        store_id: &str,
        filter: &ReadStartingWithUserFilter,
    ) -> CacheKey {
        let mut users: Vec<String> = filter
            .user_filter
            .iter()
            .map(|user| user.to_user_string())
            .collect();
        users.sort();
        users.dedup();

        let user_count = users.len().to_string();
        let id_count = filter.object_ids.as_ref().map(|ids| ids.len().to_string());

        let mut fields = vec![
            store_id,
            filter.object_type.as_str(),
            filter.relation.as_str(),
            user_count.as_str(),
        ];
        fields.extend(users.iter().map(String::as_str));

        // Distinguish "no id restriction" from "restricted to the empty set".
        match (&filter.object_ids, &id_count) {
            (Some(ids), Some(count)) => {
                fields.push("ids");
                fields.push(count.as_str());
                // BTreeSet iterates in sorted order.
                fields.extend(ids.iter().map(String::as_str));
            }
            _ => fields.push("*"),
        }
        Self::digest(OperationKind::ReadStartingWithUser, fields)
    }
}
