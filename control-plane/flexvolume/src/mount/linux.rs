use super::{MountKind, MountOptions, MountRefTracker, VolumeMounter};
use nix::errno::Errno;
use std::{io, path::Path};
use sys_mount::{unmount, Mount, MountFlags, UnmountFlags};
use tracing::{debug, trace, warn};

/// Reads the live mount table of this process from `/proc/self/mountinfo`.
#[derive(Debug, Default, Clone)]
pub struct MountInfoTracker {}

impl MountInfoTracker {
    /// Create a new `Self`.
    pub fn new() -> Self {
        Self {}
    }
}

fn proc_error(error: procfs::ProcError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error)
}

impl MountRefTracker for MountInfoTracker {
    fn mount_refs(&self, path: &str) -> io::Result<Vec<String>> {
        let path = match Path::new(path).canonicalize() {
            Ok(path) => path,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(error) => return Err(error),
        };
        let mounts = procfs::process::Process::myself()
            .and_then(|process| process.mountinfo())
            .map_err(proc_error)?;

        // the last entry for a mount point is the one which is visible
        let Some(target) = mounts.0.iter().rev().find(|m| m.mount_point == path) else {
            trace!(path = %path.display(), "Not a mount point");
            return Ok(vec![]);
        };
        let refs = mounts
            .0
            .iter()
            .filter(|m| m.majmin == target.majmin && m.root == target.root)
            .map(|m| m.mount_point.to_string_lossy().to_string())
            .collect::<Vec<_>>();
        trace!(path = %path.display(), source = %target.majmin, ?refs, "Mount references");
        Ok(refs)
    }
}

/// Mounts with the mount/umount2 syscalls.
#[derive(Debug, Default, Clone)]
pub struct SysMounter {}

impl SysMounter {
    /// Create a new `Self`.
    pub fn new() -> Self {
        Self {}
    }
}

impl VolumeMounter for SysMounter {
    fn mount(&self, source: &str, target: &str, options: &MountOptions) -> io::Result<()> {
        std::fs::create_dir_all(target)?;
        match &options.kind {
            MountKind::Filesystem(fs_type) => {
                let mut flags = MountFlags::empty();
                if options.read_only {
                    flags |= MountFlags::RDONLY;
                }
                Mount::builder()
                    .fstype(fs_type.as_str())
                    .flags(flags)
                    .mount(source, target)?;
            }
            MountKind::Bind => {
                Mount::builder()
                    .flags(MountFlags::BIND)
                    .mount(source, target)?;
                if options.read_only {
                    // a bind mount only becomes read-only when remounted
                    let remount = Mount::builder()
                        .flags(MountFlags::BIND | MountFlags::REMOUNT | MountFlags::RDONLY)
                        .mount(source, target);
                    if let Err(error) = remount {
                        warn!(
                            target,
                            %error,
                            "Failed to remount read-only, undoing the bind mount"
                        );
                        let _ = unmount(target, UnmountFlags::empty());
                        return Err(error);
                    }
                }
            }
        }
        debug!(source, target, ?options, "Mounted");
        Ok(())
    }

    fn unmount(&self, target: &str) -> io::Result<()> {
        match unmount(target, UnmountFlags::empty()) {
            Ok(()) => debug!(target, "Unmounted"),
            Err(error) => match error.raw_os_error().map(Errno::from_i32) {
                // not a mount point
                Some(Errno::EINVAL) => debug!(target, "Not mounted"),
                Some(Errno::ENOENT) => {
                    debug!(target, "Does not exist");
                    return Ok(());
                }
                _ => return Err(error),
            },
        }
        match std::fs::remove_dir(target) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                // not fatal, the directory is re-used by the next mount
                warn!(target, %error, "Failed to remove the mount directory");
                Ok(())
            }
        }
    }
}
