//! The attachment data model shared by the agent, the driver and the persistent store.
//!
//! A [`VolumeAttachment`] is the durable record of one volume being attached to one node,
//! while [`AttachOptions`] is the per-request descriptor which crosses the RPC boundary.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

/// Identity of a block volume: the storage pool and the image within it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId {
    /// The storage pool.
    pub pool: String,
    /// The image name within the pool.
    pub image: String,
}

impl VolumeId {
    /// Create a new `Self` from the pool and image names.
    pub fn new(pool: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            image: image.into(),
        }
    }
    /// Both the pool and the image must be set, and neither may contain a path separator.
    pub fn validate(&self) -> Result<(), String> {
        for (what, name) in [("pool", &self.pool), ("image", &self.image)] {
            if name.is_empty() {
                return Err(format!("missing {what} name"));
            }
            if name.contains('/') {
                return Err(format!("invalid {what} name '{name}'"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.image)
    }
}

impl FromStr for VolumeId {
    type Err = String;

    /// Parses the `pool/image` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((pool, image)) => {
                let id = Self::new(pool, image);
                id.validate()?;
                Ok(id)
            }
            None => Err(format!("volume '{s}' must be in the format 'pool/image'")),
        }
    }
}

/// Per-request attach/mount descriptor, passed across the RPC boundary.
///
/// `node`, `global_mount_path` and `device_path` are always resolved by the agent; any
/// value supplied by a client is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachOptions {
    /// The volume this request refers to.
    pub volume: VolumeId,
    /// The pod mount directory, empty for attach/detach requests.
    #[serde(default)]
    pub mount_dir: String,
    /// Filesystem type of the volume.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
    /// Whether the pod mount must be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// The node holding the attachment.
    #[serde(default)]
    pub node: Option<String>,
    /// The node-global mount path of the volume.
    #[serde(default)]
    pub global_mount_path: Option<String>,
    /// The block device the volume is attached as.
    #[serde(default)]
    pub device_path: Option<String>,
}

fn default_fs_type() -> String {
    utils::DEFAULT_FS_TYPE.to_string()
}

impl AttachOptions {
    /// Create new options for the given volume, with the default filesystem type.
    pub fn new(volume: VolumeId) -> Self {
        Self {
            volume,
            mount_dir: String::new(),
            fs_type: default_fs_type(),
            read_only: false,
            node: None,
            global_mount_path: None,
            device_path: None,
        }
    }
    /// Set the pod mount directory.
    pub fn with_mount_dir(mut self, mount_dir: impl Into<String>) -> Self {
        self.mount_dir = mount_dir.into();
        self
    }
    /// Set the filesystem type.
    pub fn with_fs_type(mut self, fs_type: impl Into<String>) -> Self {
        self.fs_type = fs_type.into();
        self
    }
    /// Set the read-only flag.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Lifecycle state of an attachment on its node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttachmentState {
    /// The block device is attached, but not mounted at the global mount path.
    Attached,
    /// The block device is mounted at the global mount path.
    GloballyMounted,
}

/// A pod mount directory bind-mounted from the global mount path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodMount {
    /// Whether the bind mount is read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Durable record of one volume attached to one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeAttachment {
    /// The attached volume.
    pub volume: VolumeId,
    /// The node the volume is attached to.
    pub node: String,
    /// The block device path on the node.
    pub device_path: String,
    /// The single node-local mount point of the volume.
    pub global_mount_path: String,
    /// Filesystem type used for the global mount.
    pub fs_type: String,
    /// Pod mount directories currently bind-mounted from the global mount path.
    #[serde(default)]
    pub pod_mounts: BTreeMap<String, PodMount>,
    /// Pod mount directories already unmounted whose volume teardown has not completed yet.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub released: BTreeSet<String>,
    /// Current lifecycle state.
    pub state: AttachmentState,
}

impl VolumeAttachment {
    /// A freshly attached, not yet mounted, volume.
    pub fn new(
        volume: VolumeId,
        node: impl Into<String>,
        device_path: impl Into<String>,
        global_mount_path: impl Into<String>,
        fs_type: impl Into<String>,
    ) -> Self {
        Self {
            volume,
            node: node.into(),
            device_path: device_path.into(),
            global_mount_path: global_mount_path.into(),
            fs_type: fs_type.into(),
            pod_mounts: BTreeMap::new(),
            released: BTreeSet::new(),
            state: AttachmentState::Attached,
        }
    }
    /// Whether the given pod mount directory is recorded against this attachment.
    pub fn references(&self, mount_dir: &str) -> bool {
        self.pod_mounts.contains_key(mount_dir)
    }
    /// Whether the pod mount directory resolves to this attachment, either as a current pod
    /// mount or as a released one.
    pub fn tracks(&self, mount_dir: &str) -> bool {
        self.references(mount_dir) || self.released.contains(mount_dir)
    }
    /// Build the `AttachOptions` describing the given pod mount directory.
    pub fn attach_options(&self, mount_dir: &str) -> AttachOptions {
        AttachOptions {
            volume: self.volume.clone(),
            mount_dir: mount_dir.to_string(),
            fs_type: self.fs_type.clone(),
            read_only: self
                .pod_mounts
                .get(mount_dir)
                .map(|pod| pod.read_only)
                .unwrap_or_default(),
            node: Some(self.node.clone()),
            global_mount_path: Some(self.global_mount_path.clone()),
            device_path: Some(self.device_path.clone()),
        }
    }
}
