use crate::{
    attachment::{AttachmentState, PodMount, VolumeAttachment, VolumeId},
    backend::{BackendError, VolumeBackend},
    controller::{AttachDetachController, ControllerConfig},
    mount::{MountKind, MountOptions, MountRefTracker, VolumeMounter},
    store::{AttachmentStore, PstorAttachmentStore},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use pstor::memory::MemStore;
use std::{
    collections::{BTreeMap, HashSet},
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

pub(crate) const NODE: &str = "n1";
pub(crate) const GLOBAL: &str = "/var/lib/rook/pool1-image1";
pub(crate) const P1: &str = "/var/lib/kubelet/pods/p1/vol";
pub(crate) const P2: &str = "/var/lib/kubelet/pods/p2/vol";

pub(crate) fn volume() -> VolumeId {
    VolumeId::new("pool1", "image1")
}

/// A mount call issued to the fake mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MountCall {
    Mount { source: String, target: String },
    Unmount { target: String },
}

#[derive(Default)]
struct Table {
    /// Mounted target to its underlying device.
    mounts: BTreeMap<String, String>,
    calls: Vec<MountCall>,
}

/// An in-memory mount table.
#[derive(Default)]
pub(crate) struct FakeMountTable {
    table: Mutex<Table>,
    fail_inspection: AtomicBool,
    fail_mount: Mutex<HashSet<String>>,
    fail_unmount: Mutex<HashSet<String>>,
}

fn failure(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, what.to_string())
}

impl FakeMountTable {
    pub(crate) fn set_fail_inspection(&self, fail: bool) {
        self.fail_inspection.store(fail, Ordering::SeqCst);
    }
    pub(crate) fn fail_mount(&self, target: &str) {
        self.fail_mount.lock().insert(target.to_string());
    }
    pub(crate) fn fail_unmount(&self, target: &str) {
        self.fail_unmount.lock().insert(target.to_string());
    }
    pub(crate) fn clear_failures(&self) {
        self.set_fail_inspection(false);
        self.fail_mount.lock().clear();
        self.fail_unmount.lock().clear();
    }
    pub(crate) fn is_mounted(&self, path: &str) -> bool {
        self.table.lock().mounts.contains_key(path)
    }
    pub(crate) fn calls(&self) -> Vec<MountCall> {
        self.table.lock().calls.clone()
    }
    pub(crate) fn unmount_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MountCall::Unmount { .. }))
            .count()
    }
    pub(crate) fn mounts_of(&self, target: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MountCall::Mount { target: t, .. } if t == target))
            .count()
    }
    pub(crate) fn unmounts_of(&self, target: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, MountCall::Unmount { target: t } if t == target))
            .count()
    }
}

impl MountRefTracker for FakeMountTable {
    fn mount_refs(&self, path: &str) -> io::Result<Vec<String>> {
        if self.fail_inspection.load(Ordering::SeqCst) {
            return Err(failure("mount table is unreadable"));
        }
        let table = self.table.lock();
        let Some(device) = table.mounts.get(path) else {
            return Ok(vec![]);
        };
        Ok(table
            .mounts
            .iter()
            .filter(|(_, d)| *d == device)
            .map(|(target, _)| target.clone())
            .collect())
    }
}

impl VolumeMounter for FakeMountTable {
    fn mount(&self, source: &str, target: &str, options: &MountOptions) -> io::Result<()> {
        if self.fail_mount.lock().contains(target) {
            return Err(failure("mount failed"));
        }
        let mut table = self.table.lock();
        let device = match options.kind {
            MountKind::Bind => table
                .mounts
                .get(source)
                .cloned()
                .ok_or_else(|| failure("bind source is not mounted"))?,
            MountKind::Filesystem(_) => source.to_string(),
        };
        table.mounts.insert(target.to_string(), device);
        table.calls.push(MountCall::Mount {
            source: source.to_string(),
            target: target.to_string(),
        });
        Ok(())
    }

    fn unmount(&self, target: &str) -> io::Result<()> {
        if self.fail_unmount.lock().contains(target) {
            return Err(failure("device or resource busy"));
        }
        let mut table = self.table.lock();
        table.mounts.remove(target);
        table.calls.push(MountCall::Unmount {
            target: target.to_string(),
        });
        Ok(())
    }
}

/// A backend counting its successful attaches and detaches.
#[derive(Default)]
pub(crate) struct CountingBackend {
    attaches: AtomicUsize,
    detaches: AtomicUsize,
    fail_attach: AtomicBool,
    fail_detach: AtomicBool,
}

impl CountingBackend {
    pub(crate) fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }
    pub(crate) fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
    pub(crate) fn set_fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }
    pub(crate) fn set_fail_detach(&self, fail: bool) {
        self.fail_detach.store(fail, Ordering::SeqCst);
    }
}

fn backend_failure() -> BackendError {
    BackendError::CommandFailed {
        binary: "rbd".to_string(),
        stderr: "connection timed out".to_string(),
    }
}

#[async_trait]
impl VolumeBackend for CountingBackend {
    async fn attach(&self, _volume: &VolumeId, _node: &str) -> Result<String, BackendError> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(backend_failure());
        }
        let index = self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(format!("/dev/rbd{index}"))
    }

    async fn detach(&self, _volume: &VolumeId, _node: &str) -> Result<(), BackendError> {
        if self.fail_detach.load(Ordering::SeqCst) {
            return Err(backend_failure());
        }
        self.detaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An attachment store which fails to remove or release pod mounts on demand.
pub(crate) struct FlakyStore {
    inner: PstorAttachmentStore<MemStore>,
    fail_remove_pod_mount: AtomicBool,
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self {
            inner: PstorAttachmentStore::new(
                MemStore::new(),
                utils::DEFAULT_STORE_PREFIX,
                Duration::from_secs(5),
            ),
            fail_remove_pod_mount: AtomicBool::new(false),
        }
    }
}

impl FlakyStore {
    pub(crate) fn set_fail_remove_pod_mount(&self, fail: bool) {
        self.fail_remove_pod_mount.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AttachmentStore for FlakyStore {
    async fn attachment(
        &self,
        node: &str,
        volume: &VolumeId,
    ) -> Result<Option<VolumeAttachment>, pstor::Error> {
        self.inner.attachment(node, volume).await
    }
    async fn find_by_mount_dir(
        &self,
        node: &str,
        mount_dir: &str,
    ) -> Result<Option<VolumeAttachment>, pstor::Error> {
        self.inner.find_by_mount_dir(node, mount_dir).await
    }
    async fn create(&self, attachment: &VolumeAttachment) -> Result<(), pstor::Error> {
        self.inner.create(attachment).await
    }
    async fn set_state(
        &self,
        node: &str,
        volume: &VolumeId,
        state: AttachmentState,
    ) -> Result<Option<VolumeAttachment>, pstor::Error> {
        self.inner.set_state(node, volume, state).await
    }
    async fn add_pod_mount(
        &self,
        node: &str,
        volume: &VolumeId,
        mount_dir: &str,
        pod_mount: PodMount,
    ) -> Result<Option<VolumeAttachment>, pstor::Error> {
        self.inner
            .add_pod_mount(node, volume, mount_dir, pod_mount)
            .await
    }
    async fn remove_pod_mount(
        &self,
        node: &str,
        volume: &VolumeId,
        mount_dir: &str,
    ) -> Result<(), pstor::Error> {
        if self.fail_remove_pod_mount.load(Ordering::SeqCst) {
            return Err(pstor::Error::Timeout {
                operation: "put".to_string(),
                timeout: Duration::from_secs(5),
            });
        }
        self.inner.remove_pod_mount(node, volume, mount_dir).await
    }
    async fn release_pod_mount(
        &self,
        node: &str,
        volume: &VolumeId,
        mount_dir: &str,
    ) -> Result<(), pstor::Error> {
        if self.fail_remove_pod_mount.load(Ordering::SeqCst) {
            return Err(pstor::Error::Timeout {
                operation: "put".to_string(),
                timeout: Duration::from_secs(5),
            });
        }
        self.inner.release_pod_mount(node, volume, mount_dir).await
    }
    async fn delete(&self, node: &str, volume: &VolumeId) -> Result<(), pstor::Error> {
        self.inner.delete(node, volume).await
    }
    async fn list(&self, node: &str) -> Result<Vec<VolumeAttachment>, pstor::Error> {
        self.inner.list(node).await
    }
    async fn online(&self) -> bool {
        self.inner.online().await
    }
}

/// A controller wired to fakes, which remain reachable for inspection.
pub(crate) struct Harness {
    pub(crate) controller: AttachDetachController,
    pub(crate) mounts: Arc<FakeMountTable>,
    pub(crate) backend: Arc<CountingBackend>,
    pub(crate) store: Arc<FlakyStore>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let mounts = Arc::new(FakeMountTable::default());
        let backend = Arc::new(CountingBackend::default());
        let store = Arc::new(FlakyStore::default());
        let controller = AttachDetachController::new(
            ControllerConfig::new(NODE).with_global_mount_root("/var/lib/rook"),
            store.clone(),
            backend.clone(),
            mounts.clone(),
            mounts.clone(),
        );
        Self {
            controller,
            mounts,
            backend,
            store,
        }
    }

    pub(crate) async fn attachment(&self) -> Option<VolumeAttachment> {
        self.store.attachment(NODE, &volume()).await.unwrap()
    }
}
