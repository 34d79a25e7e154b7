use crate::{
    api::{Revision, Store, StoreKey, StoreKv, StoreValue, Versioned},
    error::{Error, Persist, SerialiseValue},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;

/// A single stored entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: Value,
    revision: Revision,
}

/// The whole contents of the store, which is also the on-disk format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Contents {
    /// Last handed out revision.
    revision: Revision,
    entries: BTreeMap<String, Entry>,
}

impl Contents {
    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        self.revision
    }
}

/// An in-process key-value store.
/// When created with a backing file, every mutation is written through and synced to it
/// before it becomes visible, so the contents survive a restart of the process or the node.
/// The file is written on the blocking pool, mutations queue on the async lock meanwhile.
#[derive(Clone, Debug, Default)]
pub struct MemStore {
    contents: Arc<Mutex<Contents>>,
    path: Option<PathBuf>,
}

impl MemStore {
    /// Create a new, empty and volatile store.
    pub fn new() -> Self {
        Self::default()
    }
    /// Create a store backed by the file at `path`, loading its existing contents if any.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let contents = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Contents::default(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| Error::DeserialiseValue {
                value: String::from_utf8_lossy(&bytes).to_string(),
                source,
            })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Contents::default(),
            Err(source) => return Err(Error::Load { path, source }),
        };
        tracing::debug!(path = %path.display(), entries = contents.entries.len(), "Loaded store");
        Ok(Self {
            contents: Arc::new(Mutex::new(contents)),
            path: Some(path),
        })
    }
    /// The backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply `mutate` to a copy of the contents, write it through and only then commit it.
    async fn mutate<R>(
        &self,
        mutate: impl FnOnce(&mut Contents) -> Result<R, Error> + Send,
    ) -> Result<R, Error> {
        let mut contents = self.contents.lock().await;
        let mut next = contents.clone();
        let result = mutate(&mut next)?;
        if let Some(path) = &self.path {
            let target = path.clone();
            next = tokio::task::spawn_blocking(move || persist(&target, &next).map(|_| next))
                .await
                .map_err(|error| Error::Persist {
                    path: path.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, error),
                })??;
        }
        *contents = next;
        Ok(result)
    }
}

/// Write the contents to a sibling temporary file, sync it and atomically rename it into
/// place, then sync the directory so the rename is durable too.
fn persist(path: &Path, contents: &Contents) -> Result<(), Error> {
    let bytes = serde_json::to_vec_pretty(contents).context(SerialiseValue)?;
    let parent = path.parent().filter(|parent| !parent.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent).context(Persist { path })?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp).context(Persist { path: &tmp })?;
    file.write_all(&bytes).context(Persist { path: &tmp })?;
    file.sync_all().context(Persist { path: &tmp })?;
    std::fs::rename(&tmp, path).context(Persist { path })?;
    if let Some(parent) = parent {
        std::fs::File::open(parent)
            .and_then(|dir| dir.sync_all())
            .context(Persist { path: parent })?;
    }
    Ok(())
}

fn to_value<V: StoreValue>(value: &V) -> Result<Value, Error> {
    serde_json::to_value(value).context(SerialiseValue)
}

#[async_trait]
impl StoreKv for MemStore {
    async fn put_kv<K: StoreKey, V: StoreValue>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<Revision, Error> {
        let value = to_value(value)?;
        self.mutate(|contents| {
            let revision = contents.next_revision();
            contents
                .entries
                .insert(key.to_string(), Entry { value, revision });
            Ok(revision)
        })
        .await
    }

    async fn put_kv_if<K: StoreKey, V: StoreValue>(
        &mut self,
        key: &K,
        value: &V,
        expected: Option<Revision>,
    ) -> Result<Revision, Error> {
        let value = to_value(value)?;
        let key = key.to_string();
        self.mutate(|contents| {
            let current = contents.entries.get(&key).map(|entry| entry.revision);
            if current != expected {
                return Err(Error::Conflict { key, expected });
            }
            let revision = contents.next_revision();
            contents.entries.insert(key, Entry { value, revision });
            Ok(revision)
        })
        .await
    }

    async fn get_kv<K: StoreKey>(&mut self, key: &K) -> Result<Versioned, Error> {
        let key = key.to_string();
        match self.contents.lock().await.entries.get(&key) {
            Some(entry) => Ok(Versioned {
                value: entry.value.clone(),
                revision: entry.revision,
            }),
            None => Err(Error::MissingEntry { key }),
        }
    }

    async fn delete_kv<K: StoreKey>(&mut self, key: &K) -> Result<(), Error> {
        let key = key.to_string();
        if !self.contents.lock().await.entries.contains_key(&key) {
            return Ok(());
        }
        self.mutate(|contents| {
            contents.entries.remove(&key);
            contents.next_revision();
            Ok(())
        })
        .await
    }

    async fn delete_kv_if<K: StoreKey>(
        &mut self,
        key: &K,
        expected: Revision,
    ) -> Result<(), Error> {
        let key = key.to_string();
        self.mutate(|contents| {
            match contents.entries.get(&key) {
                Some(entry) if entry.revision == expected => {}
                _ => {
                    return Err(Error::Conflict {
                        key,
                        expected: Some(expected),
                    })
                }
            }
            contents.entries.remove(&key);
            contents.next_revision();
            Ok(())
        })
        .await
    }

    async fn get_values_prefix(
        &mut self,
        key_prefix: &str,
    ) -> Result<Vec<(String, Versioned)>, Error> {
        let contents = self.contents.lock().await;
        Ok(contents
            .entries
            .range(key_prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(key_prefix))
            .map(|(key, entry)| {
                (
                    key.clone(),
                    Versioned {
                        value: entry.value.clone(),
                        revision: entry.revision,
                    },
                )
            })
            .collect())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn online(&mut self) -> bool {
        true
    }
}
