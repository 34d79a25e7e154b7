use crate::Error;
use async_trait::async_trait;
use serde_json::Value;

/// Modification revision of an entry in the store.
/// Every successful write yields a new, strictly greater, revision.
pub type Revision = i64;

/// A value read from the store, along with the revision at which it was last modified.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    /// The stored json value.
    pub value: Value,
    /// The last modification revision of the entry.
    pub revision: Revision,
}

/// Trait defining the operations that can be performed on a key-value store.
#[async_trait]
pub trait Store: StoreKv + Sync + Send + Clone {
    async fn online(&mut self) -> bool;
}

/// Trait defining the operations that can be performed on a key-value store.
/// This is strictly intended for a KV type access.
#[async_trait]
pub trait StoreKv: Sync + Send + Clone {
    /// Puts the given `V` value into the under the given `K` key, regardless of what's there.
    async fn put_kv<K: StoreKey, V: StoreValue>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<Revision, Error>;
    /// Puts the given `V` value under the given `K` key, only if the entry is still at the
    /// `expected` revision. `None` means the entry must not exist yet.
    /// Fails with `Error::Conflict` otherwise.
    async fn put_kv_if<K: StoreKey, V: StoreValue>(
        &mut self,
        key: &K,
        value: &V,
        expected: Option<Revision>,
    ) -> Result<Revision, Error>;
    /// Get the value from the given `K` key entry from the store.
    /// Fails with `Error::MissingEntry` if there is no such entry.
    async fn get_kv<K: StoreKey>(&mut self, key: &K) -> Result<Versioned, Error>;
    /// Deletes the given `K` key entry from the store.
    /// Deleting a missing entry is not an error.
    async fn delete_kv<K: StoreKey>(&mut self, key: &K) -> Result<(), Error>;
    /// Deletes the given `K` key entry only if it is still at the `expected` revision.
    /// Fails with `Error::Conflict` otherwise, including when the entry is gone.
    async fn delete_kv_if<K: StoreKey>(&mut self, key: &K, expected: Revision)
        -> Result<(), Error>;
    /// Returns a vector of tuples. Each tuple represents a key-value pair.
    async fn get_values_prefix(
        &mut self,
        key_prefix: &str,
    ) -> Result<Vec<(String, Versioned)>, Error>;
}

/// Store keys type trait.
pub trait StoreKey: Sync + ToString {}
impl<T> StoreKey for T where T: Sync + ToString {}
/// Store value type trait.
pub trait StoreValue: Sync + serde::Serialize {}
impl<T> StoreValue for T where T: Sync + serde::Serialize {}
