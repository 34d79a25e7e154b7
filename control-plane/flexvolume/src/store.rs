//! Durable attachment records.
//!
//! Each record lives under `{prefix}/{node}/{pool}/{image}` as a json encoded
//! [`VolumeAttachment`]. Every write is a compare-and-set against the revision which was
//! read, and is retried a bounded number of times when another writer got there first.

use crate::attachment::{AttachmentState, PodMount, VolumeAttachment, VolumeId};
use async_trait::async_trait;
use pstor::{Error, Revision, Store, Versioned};
use std::{future::Future, time::Duration};
use tracing::{debug, trace};

/// Attachment records of the nodes.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Get the attachment record of the volume on the node, if any.
    async fn attachment(
        &self,
        node: &str,
        volume: &VolumeId,
    ) -> Result<Option<VolumeAttachment>, Error>;
    /// Find the attachment record of the node which references the pod mount directory,
    /// either as a pod mount or as a released one.
    async fn find_by_mount_dir(
        &self,
        node: &str,
        mount_dir: &str,
    ) -> Result<Option<VolumeAttachment>, Error>;
    /// Create a new attachment record, failing if one already exists.
    async fn create(&self, attachment: &VolumeAttachment) -> Result<(), Error>;
    /// Set the state of the attachment record, returning the updated record if it exists.
    async fn set_state(
        &self,
        node: &str,
        volume: &VolumeId,
        state: AttachmentState,
    ) -> Result<Option<VolumeAttachment>, Error>;
    /// Add a pod mount directory to the attachment record, returning the updated record
    /// if it exists.
    async fn add_pod_mount(
        &self,
        node: &str,
        volume: &VolumeId,
        mount_dir: &str,
        pod_mount: PodMount,
    ) -> Result<Option<VolumeAttachment>, Error>;
    /// Remove a pod mount directory from the attachment record.
    /// Removing a pod mount which is not recorded succeeds.
    async fn remove_pod_mount(
        &self,
        node: &str,
        volume: &VolumeId,
        mount_dir: &str,
    ) -> Result<(), Error>;
    /// Move a pod mount directory of the attachment record to its released set, which keeps
    /// it resolvable until the record is deleted.
    async fn release_pod_mount(
        &self,
        node: &str,
        volume: &VolumeId,
        mount_dir: &str,
    ) -> Result<(), Error>;
    /// Delete the attachment record. Deleting a missing record succeeds.
    async fn delete(&self, node: &str, volume: &VolumeId) -> Result<(), Error>;
    /// List all attachment records of the node.
    async fn list(&self, node: &str) -> Result<Vec<VolumeAttachment>, Error>;
    /// Whether the underlying store can be reached.
    async fn online(&self) -> bool;
}

/// An `AttachmentStore` on top of a persistent key-value store.
#[derive(Debug, Clone)]
pub struct PstorAttachmentStore<S> {
    store: S,
    prefix: String,
    timeout: Duration,
    retries: u32,
}

impl<S: Store> PstorAttachmentStore<S> {
    /// Create a new `Self` keeping its records under `prefix`, with every store operation
    /// bounded by `timeout`.
    pub fn new(store: S, prefix: &str, timeout: Duration) -> Self {
        Self {
            store,
            prefix: prefix.trim_end_matches('/').to_string(),
            timeout,
            retries: utils::STORE_CAS_RETRIES,
        }
    }

    fn node_prefix(&self, node: &str) -> String {
        format!("{}/{node}/", self.prefix)
    }
    fn key(&self, node: &str, volume: &VolumeId) -> String {
        format!("{}{}/{}", self.node_prefix(node), volume.pool, volume.image)
    }

    async fn timed<T>(
        &self,
        operation: &str,
        future: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<(VolumeAttachment, Revision)>, Error> {
        let mut store = self.store.clone();
        match self.timed("get", store.get_kv(&key)).await {
            Ok(versioned) => decode(versioned).map(Some),
            Err(error) if error.is_missing() => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Read-modify-write of the record with compare-and-set, retried on conflicts.
    /// `modify` returns false if the record needs no change.
    async fn update<F>(
        &self,
        node: &str,
        volume: &VolumeId,
        modify: F,
    ) -> Result<Option<VolumeAttachment>, Error>
    where
        F: Fn(&mut VolumeAttachment) -> bool + Send + Sync,
    {
        let key = self.key(node, volume);
        let mut attempt = 0;
        loop {
            let Some((mut attachment, revision)) = self.get(&key).await? else {
                return Ok(None);
            };
            if !modify(&mut attachment) {
                return Ok(Some(attachment));
            }
            let mut store = self.store.clone();
            match self
                .timed("put", store.put_kv_if(&key, &attachment, Some(revision)))
                .await
            {
                Ok(_) => return Ok(Some(attachment)),
                Err(error) if error.is_conflict() && attempt < self.retries => {
                    attempt += 1;
                    trace!(key, attempt, "Attachment record changed concurrently, retrying");
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Delete the record only if it's still at `revision`.
    async fn delete_at(&self, key: &str, revision: Revision) -> Result<(), Error> {
        let mut store = self.store.clone();
        self.timed("delete", store.delete_kv_if(&key, revision))
            .await
    }
}

fn decode(versioned: Versioned) -> Result<(VolumeAttachment, Revision), Error> {
    let attachment = serde_json::from_value(versioned.value.clone()).map_err(|source| {
        Error::DeserialiseValue {
            value: versioned.value.to_string(),
            source,
        }
    })?;
    Ok((attachment, versioned.revision))
}

#[async_trait]
impl<S: Store> AttachmentStore for PstorAttachmentStore<S> {
    async fn attachment(
        &self,
        node: &str,
        volume: &VolumeId,
    ) -> Result<Option<VolumeAttachment>, Error> {
        let found = self.get(&self.key(node, volume)).await?;
        Ok(found.map(|(attachment, _)| attachment))
    }

    async fn find_by_mount_dir(
        &self,
        node: &str,
        mount_dir: &str,
    ) -> Result<Option<VolumeAttachment>, Error> {
        Ok(self
            .list(node)
            .await?
            .into_iter()
            .find(|attachment| attachment.tracks(mount_dir)))
    }

    async fn create(&self, attachment: &VolumeAttachment) -> Result<(), Error> {
        let key = self.key(&attachment.node, &attachment.volume);
        let mut store = self.store.clone();
        self.timed("create", store.put_kv_if(&key, attachment, None))
            .await?;
        debug!(key, "Created attachment record");
        Ok(())
    }

    async fn set_state(
        &self,
        node: &str,
        volume: &VolumeId,
        state: AttachmentState,
    ) -> Result<Option<VolumeAttachment>, Error> {
        self.update(node, volume, |attachment| {
            let changed = attachment.state != state;
            attachment.state = state;
            changed
        })
        .await
    }

    async fn add_pod_mount(
        &self,
        node: &str,
        volume: &VolumeId,
        mount_dir: &str,
        pod_mount: PodMount,
    ) -> Result<Option<VolumeAttachment>, Error> {
        self.update(node, volume, |attachment| {
            let previous = attachment
                .pod_mounts
                .insert(mount_dir.to_string(), pod_mount.clone());
            let unreleased = attachment.released.remove(mount_dir);
            previous.as_ref() != Some(&pod_mount) || unreleased
        })
        .await
    }

    async fn remove_pod_mount(
        &self,
        node: &str,
        volume: &VolumeId,
        mount_dir: &str,
    ) -> Result<(), Error> {
        self.update(node, volume, |attachment| {
            let removed = attachment.pod_mounts.remove(mount_dir).is_some();
            attachment.released.remove(mount_dir) || removed
        })
        .await?;
        Ok(())
    }

    async fn release_pod_mount(
        &self,
        node: &str,
        volume: &VolumeId,
        mount_dir: &str,
    ) -> Result<(), Error> {
        self.update(node, volume, |attachment| {
            let removed = attachment.pod_mounts.remove(mount_dir).is_some();
            attachment.released.insert(mount_dir.to_string()) || removed
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, node: &str, volume: &VolumeId) -> Result<(), Error> {
        let key = self.key(node, volume);
        let mut attempt = 0;
        loop {
            let Some((_, revision)) = self.get(&key).await? else {
                return Ok(());
            };
            match self.delete_at(&key, revision).await {
                Ok(()) => {
                    debug!(key, "Deleted attachment record");
                    return Ok(());
                }
                Err(error) if error.is_conflict() && attempt < self.retries => {
                    attempt += 1;
                    trace!(key, attempt, "Attachment record changed concurrently, retrying");
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn list(&self, node: &str) -> Result<Vec<VolumeAttachment>, Error> {
        let prefix = self.node_prefix(node);
        let mut store = self.store.clone();
        let values = self
            .timed("list", store.get_values_prefix(&prefix))
            .await?;
        values
            .into_iter()
            .map(|(_, versioned)| decode(versioned).map(|(attachment, _)| attachment))
            .collect()
    }

    async fn online(&self) -> bool {
        let mut store = self.store.clone();
        self.timed("online", async { Ok(store.online().await) })
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pstor::{memory::MemStore, StoreKv};

    fn store() -> PstorAttachmentStore<MemStore> {
        PstorAttachmentStore::new(
            MemStore::new(),
            "/flexvolume/attachments/",
            Duration::from_secs(5),
        )
    }

    fn attachment(node: &str, image: &str) -> VolumeAttachment {
        VolumeAttachment::new(
            VolumeId::new("pool1", image),
            node,
            "/dev/rbd0",
            format!("/var/lib/rook/pool1-{image}"),
            "ext4",
        )
    }

    #[tokio::test]
    async fn record_lifecycle() {
        let store = store();
        let volume = VolumeId::new("pool1", "image1");
        assert_eq!(store.attachment("n1", &volume).await.unwrap(), None);

        store.create(&attachment("n1", "image1")).await.unwrap();
        let error = store.create(&attachment("n1", "image1")).await.unwrap_err();
        assert!(error.is_conflict());

        let updated = store
            .add_pod_mount("n1", &volume, "/pods/p1/vol", PodMount::default())
            .await
            .unwrap()
            .unwrap();
        assert!(updated.references("/pods/p1/vol"));

        let found = store.find_by_mount_dir("n1", "/pods/p1/vol").await.unwrap();
        assert_eq!(found.map(|a| a.volume), Some(volume.clone()));
        assert_eq!(store.find_by_mount_dir("n2", "/pods/p1/vol").await.unwrap(), None);

        store.remove_pod_mount("n1", &volume, "/pods/p1/vol").await.unwrap();
        store.remove_pod_mount("n1", &volume, "/pods/p1/vol").await.unwrap();
        assert_eq!(store.find_by_mount_dir("n1", "/pods/p1/vol").await.unwrap(), None);

        store.delete("n1", &volume).await.unwrap();
        store.delete("n1", &volume).await.unwrap();
        store.remove_pod_mount("n1", &volume, "/pods/p1/vol").await.unwrap();
        assert_eq!(store.attachment("n1", &volume).await.unwrap(), None);
    }

    #[tokio::test]
    async fn released_pod_mounts_stay_resolvable() {
        let store = store();
        let volume = VolumeId::new("pool1", "image1");
        store.create(&attachment("n1", "image1")).await.unwrap();
        store
            .add_pod_mount("n1", &volume, "/pods/p1/vol", PodMount::default())
            .await
            .unwrap();

        store.release_pod_mount("n1", &volume, "/pods/p1/vol").await.unwrap();
        store.release_pod_mount("n1", &volume, "/pods/p1/vol").await.unwrap();
        let found = store
            .find_by_mount_dir("n1", "/pods/p1/vol")
            .await
            .unwrap()
            .unwrap();
        assert!(found.pod_mounts.is_empty());
        assert!(found.tracks("/pods/p1/vol"));

        // mounting it again makes it a pod mount once more
        let updated = store
            .add_pod_mount("n1", &volume, "/pods/p1/vol", PodMount::default())
            .await
            .unwrap()
            .unwrap();
        assert!(updated.references("/pods/p1/vol"));
        assert!(updated.released.is_empty());

        store.release_pod_mount("n1", &volume, "/pods/p1/vol").await.unwrap();
        store.remove_pod_mount("n1", &volume, "/pods/p1/vol").await.unwrap();
        assert_eq!(store.find_by_mount_dir("n1", "/pods/p1/vol").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_revision_checked() {
        let store = store();
        let volume = VolumeId::new("pool1", "image1");
        store.create(&attachment("n1", "image1")).await.unwrap();
        let key = store.key("n1", &volume);
        let (_, stale) = store.get(&key).await.unwrap().unwrap();

        store
            .add_pod_mount("n1", &volume, "/pods/p1/vol", PodMount::default())
            .await
            .unwrap();
        let error = store.delete_at(&key, stale).await.unwrap_err();
        assert!(error.is_conflict(), "{error}");
        assert!(store.attachment("n1", &volume).await.unwrap().is_some());

        store.delete("n1", &volume).await.unwrap();
        assert_eq!(store.attachment("n1", &volume).await.unwrap(), None);
        store.delete("n1", &volume).await.unwrap();
        assert!(store.online().await);
    }

    #[tokio::test]
    async fn records_are_per_node() {
        let store = store();
        store.create(&attachment("n1", "image1")).await.unwrap();
        store.create(&attachment("n1", "image2")).await.unwrap();
        store.create(&attachment("n10", "image1")).await.unwrap();

        let n1 = store.list("n1").await.unwrap();
        assert_eq!(n1.len(), 2);
        assert!(n1.iter().all(|a| a.node == "n1"));
        assert_eq!(store.list("n10").await.unwrap().len(), 1);
        assert!(store.list("n2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_key_layout() {
        let store = store();
        store.create(&attachment("n1", "image1")).await.unwrap();
        let mut kv = store.store.clone();
        let versioned = kv
            .get_kv(&"/flexvolume/attachments/n1/pool1/image1")
            .await
            .unwrap();
        assert_eq!(versioned.value["global_mount_path"], "/var/lib/rook/pool1-image1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        let store = store();
        let volume = VolumeId::new("pool1", "image1");
        store.create(&attachment("n1", "image1")).await.unwrap();

        let tasks = (0 .. 4)
            .map(|i| {
                let store = store.clone();
                let volume = volume.clone();
                tokio::spawn(async move {
                    let mount_dir = format!("/pods/p{i}/vol");
                    store
                        .add_pod_mount("n1", &volume, &mount_dir, PodMount::default())
                        .await
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let attachment = store.attachment("n1", &volume).await.unwrap().unwrap();
        assert_eq!(attachment.pod_mounts.len(), 4);
    }
}
