//! Mount capabilities of the host.
//!
//! [`MountRefTracker`] reports which mounted paths share the same source, which is what
//! decides whether a global mount path is still in use. [`VolumeMounter`] performs the
//! actual mounts and unmounts.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::{MountInfoTracker, SysMounter};

use std::path::Path;

/// Reports the live references of a mounted path.
pub trait MountRefTracker: Send + Sync {
    /// Every currently mounted path which shares the same underlying source as `path`,
    /// including `path` itself.
    /// Returns an empty list if `path` is not a mount point.
    fn mount_refs(&self, path: &str) -> std::io::Result<Vec<String>>;
}

/// Mounts and unmounts paths.
pub trait VolumeMounter: Send + Sync {
    /// Mount `source` on `target`, creating `target` if needed.
    fn mount(&self, source: &str, target: &str, options: &MountOptions) -> std::io::Result<()>;
    /// Unmount `target`.
    /// Unmounting a path which is not mounted, or which does not exist, succeeds.
    fn unmount(&self, target: &str) -> std::io::Result<()>;
}

/// How a source is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// Mount a block device with the given filesystem type.
    Filesystem(String),
    /// Bind mount an existing mount point.
    Bind,
}

/// Options for [`VolumeMounter::mount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Filesystem or bind mount.
    pub kind: MountKind,
    /// Mount read-only.
    pub read_only: bool,
}

impl MountOptions {
    /// Mount a block device with the given filesystem type, read-write.
    pub fn filesystem(fs_type: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Filesystem(fs_type.into()),
            read_only: false,
        }
    }
    /// Bind mount an existing mount point.
    pub fn bind(read_only: bool) -> Self {
        Self {
            kind: MountKind::Bind,
            read_only,
        }
    }
}

/// Whether the two paths name the same location, ignoring trailing separators.
pub(crate) fn same_path(a: &str, b: &str) -> bool {
    Path::new(a) == Path::new(b)
}

/// A snapshot of the references of a pod mount directory, taken before it is unmounted.
#[derive(Debug, Clone)]
pub struct MountRefs {
    path: String,
    refs: Vec<String>,
}

impl MountRefs {
    /// Create a new `Self` from the references reported for `path`.
    pub fn new(path: impl Into<String>, refs: Vec<String>) -> Self {
        Self {
            path: path.into(),
            refs,
        }
    }
    /// The references other than the path itself.
    pub fn remaining(&self) -> impl Iterator<Item = &str> {
        self.refs
            .iter()
            .map(String::as_str)
            .filter(|r| !same_path(r, &self.path))
    }
    /// Number of references other than the path itself.
    pub fn len(&self) -> usize {
        self.remaining().count()
    }
    /// Whether there are no references other than the path itself.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Once the path is gone, is `global_mount_path` left without any pod reference?
    pub fn is_last_reference(&self, global_mount_path: &str) -> bool {
        self.remaining().all(|r| same_path(r, global_mount_path))
    }
}
