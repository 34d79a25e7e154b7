use crate::{
    api::{Revision, Store, StoreKey, StoreKv, StoreValue, Versioned},
    error::{
        ClientError, Connect, Delete, DeserialiseValue, Error, Get, GetPrefix, KeyString, Put,
        SerialiseValue,
    },
};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, GetOptions, KeyValue, Txn, TxnOp};
use snafu::ResultExt;
use std::time::Duration;

/// etcd client
#[derive(Clone)]
pub struct Etcd {
    client: Client,
}

impl std::fmt::Debug for Etcd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Etcd").finish_non_exhaustive()
    }
}

fn boxed(error: etcd_client::Error) -> ClientError {
    Box::new(error)
}

impl Etcd {
    /// Create a new instance of the etcd client.
    /// `timeout` bounds both the connection attempt and every request.
    pub async fn new(endpoint: &str, timeout: Duration) -> Result<Etcd, Error> {
        let options = ConnectOptions::new()
            .with_connect_timeout(timeout)
            .with_timeout(timeout);
        let client = Client::connect([endpoint], Some(options))
            .await
            .map_err(boxed)
            .context(Connect)?;
        Ok(Self { client })
    }

    /// Build the etcd comparison which asserts the key is at the `expected` revision.
    /// A `None` revision asserts that the key does not exist.
    fn revision_is(key: String, expected: Option<Revision>) -> Compare {
        match expected {
            Some(revision) => Compare::mod_revision(key, CompareOp::Equal, revision),
            None => Compare::version(key, CompareOp::Equal, 0),
        }
    }
}

#[async_trait]
impl StoreKv for Etcd {
    /// 'Put' a key-value pair into etcd.
    async fn put_kv<K: StoreKey, V: StoreValue>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<Revision, Error> {
        let vec_value = serde_json::to_vec(value).context(SerialiseValue)?;
        let resp = self
            .client
            .put(key.to_string(), vec_value, None)
            .await
            .map_err(boxed)
            .context(Put {
                key: key.to_string(),
                value: serde_json::to_string(value).context(SerialiseValue)?,
            })?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    /// 'Put' a key-value pair into etcd, in a transaction guarded by the key's revision.
    async fn put_kv_if<K: StoreKey, V: StoreValue>(
        &mut self,
        key: &K,
        value: &V,
        expected: Option<Revision>,
    ) -> Result<Revision, Error> {
        let vec_value = serde_json::to_vec(value).context(SerialiseValue)?;
        let cmp = Self::revision_is(key.to_string(), expected);
        let put = TxnOp::put(key.to_string(), vec_value, None);
        let resp = self
            .client
            .txn(Txn::new().when([cmp]).and_then([put]))
            .await
            .map_err(boxed)
            .context(Put {
                key: key.to_string(),
                value: serde_json::to_string(value).context(SerialiseValue)?,
            })?;
        if !resp.succeeded() {
            return Err(Error::Conflict {
                key: key.to_string(),
                expected,
            });
        }
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default())
    }

    /// 'Get' the value for the given key from etcd.
    async fn get_kv<K: StoreKey>(&mut self, key: &K) -> Result<Versioned, Error> {
        let resp = self
            .client
            .get(key.to_string(), None)
            .await
            .map_err(boxed)
            .context(Get {
                key: key.to_string(),
            })?;
        match resp.kvs().first() {
            Some(kv) => deserialise_kv(kv).map(|(_, versioned)| versioned),
            None => Err(Error::MissingEntry {
                key: key.to_string(),
            }),
        }
    }

    /// 'Delete' the entry with the given key from etcd.
    async fn delete_kv<K: StoreKey>(&mut self, key: &K) -> Result<(), Error> {
        self.client
            .delete(key.to_string(), None)
            .await
            .map_err(boxed)
            .context(Delete {
                key: key.to_string(),
            })?;
        Ok(())
    }

    /// 'Delete' the entry with the given key from etcd, if it's still at the expected revision.
    async fn delete_kv_if<K: StoreKey>(
        &mut self,
        key: &K,
        expected: Revision,
    ) -> Result<(), Error> {
        let cmp = Self::revision_is(key.to_string(), Some(expected));
        let del = TxnOp::delete(key.to_string(), None);
        let resp = self
            .client
            .txn(Txn::new().when([cmp]).and_then([del]))
            .await
            .map_err(boxed)
            .context(Delete {
                key: key.to_string(),
            })?;
        if !resp.succeeded() {
            return Err(Error::Conflict {
                key: key.to_string(),
                expected: Some(expected),
            });
        }
        Ok(())
    }

    /// Retrieve objects with the given key prefix
    async fn get_values_prefix(
        &mut self,
        key_prefix: &str,
    ) -> Result<Vec<(String, Versioned)>, Error> {
        let resp = self
            .client
            .get(key_prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(boxed)
            .context(GetPrefix { prefix: key_prefix })?;
        resp.kvs().iter().map(deserialise_kv).collect()
    }
}

#[async_trait]
impl Store for Etcd {
    async fn online(&mut self) -> bool {
        self.client.status().await.is_ok()
    }
}

/// Deserialise a key-value pair into its key and versioned json value.
fn deserialise_kv(kv: &KeyValue) -> Result<(String, Versioned), Error> {
    let key = kv.key_str().map_err(boxed).context(KeyString)?.to_string();
    let value = serde_json::from_slice(kv.value()).context(DeserialiseValue {
        value: String::from_utf8_lossy(kv.value()).to_string(),
    })?;
    Ok((
        key,
        Versioned {
            value,
            revision: kv.mod_revision(),
        },
    ))
}
