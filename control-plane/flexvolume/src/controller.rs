//! The node-resident attach/detach controller.
//!
//! A volume is attached to a node and mounted exactly once on its global mount path, which
//! every pod on the node then bind mounts. The controller keeps the attachment records of its
//! own node and decides, from the live mount table, when the last pod stopped using a volume
//! so that the global mount and the attachment can be torn down.
//!
//! Every operation on a volume holds the volume's lock across its whole read-then-act
//! sequence.

use crate::{
    attachment::{AttachOptions, AttachmentState, PodMount, VolumeAttachment, VolumeId},
    backend::VolumeBackend,
    error::{self, Error, ErrorKind},
    limiter::VolumeLocks,
    mount::{same_path, MountOptions, MountRefTracker, MountRefs, VolumeMounter},
    store::AttachmentStore,
};
use snafu::ResultExt;
use std::{io, path::PathBuf, sync::Arc};
use tracing::{debug, error, info, warn};

/// Configuration of the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// The node this controller manages.
    pub node_name: String,
    /// Directory under which the global mount paths are created.
    pub global_mount_root: PathBuf,
}

impl ControllerConfig {
    /// Create a new `Self` with the default global mount root.
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            global_mount_root: PathBuf::from(utils::DEFAULT_GLOBAL_MOUNT_ROOT),
        }
    }
    /// Set the global mount root.
    pub fn with_global_mount_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.global_mount_root = root.into();
        self
    }
}

/// The attach/detach controller of a single node.
#[derive(Clone)]
pub struct AttachDetachController {
    config: ControllerConfig,
    store: Arc<dyn AttachmentStore>,
    backend: Arc<dyn VolumeBackend>,
    mounter: Arc<dyn VolumeMounter>,
    tracker: Arc<dyn MountRefTracker>,
    locks: VolumeLocks,
}

impl std::fmt::Debug for AttachDetachController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachDetachController")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

/// Run a blocking mount table operation off the async workers.
async fn blocking<R, F>(operation: F) -> io::Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> io::Result<R> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .unwrap_or_else(|error| Err(io::Error::new(io::ErrorKind::Other, error)))
}

fn validate(options: &AttachOptions) -> Result<(), Error> {
    options
        .volume
        .validate()
        .map_err(|message| Error::InvalidArgument { message })
}

fn required_mount_dir(options: &AttachOptions) -> Result<&str, Error> {
    validate(options)?;
    if !options.mount_dir.starts_with('/') {
        return Err(Error::InvalidArgument {
            message: format!("mount dir '{}' is not an absolute path", options.mount_dir),
        });
    }
    Ok(options.mount_dir.as_str())
}

impl AttachDetachController {
    /// Create a new `Self` from its collaborators.
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn AttachmentStore>,
        backend: Arc<dyn VolumeBackend>,
        mounter: Arc<dyn VolumeMounter>,
        tracker: Arc<dyn MountRefTracker>,
    ) -> Self {
        Self {
            config,
            store,
            backend,
            mounter,
            tracker,
            locks: VolumeLocks::new(),
        }
    }

    /// The node this controller manages.
    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }
    fn node(&self) -> String {
        self.config.node_name.clone()
    }

    /// The global mount path a volume gets when attached to this node.
    pub fn global_mount_path_of(&self, volume: &VolumeId) -> String {
        self.config
            .global_mount_root
            .join(format!("{}-{}", volume.pool, volume.image))
            .to_string_lossy()
            .to_string()
    }

    /// Resolve a pod mount directory to the options of the volume mounted on it.
    pub async fn attach_info_from_mount_dir(
        &self,
        mount_dir: &str,
    ) -> Result<AttachOptions, Error> {
        let attachment = self
            .store
            .find_by_mount_dir(self.node_name(), mount_dir)
            .await
            .context(error::ListAttachments { node: self.node() })?
            .ok_or_else(|| Error::MountDirNotFound {
                node: self.node(),
                mount_dir: mount_dir.to_string(),
            })?;
        Ok(attachment.attach_options(mount_dir))
    }

    /// The global mount path of a volume attached to this node.
    pub async fn global_mount_path(&self, volume: &VolumeId) -> Result<String, Error> {
        match self.attachment(volume).await? {
            Some(attachment) => Ok(attachment.global_mount_path),
            None => Err(Error::GlobalMountPathNotFound {
                node: self.node(),
                volume: volume.clone(),
            }),
        }
    }

    /// Remove the pod mount directory of the options from the volume's attachment record.
    /// Removing a pod mount which is no longer recorded succeeds.
    pub async fn remove_attachment_object(&self, options: &AttachOptions) -> Result<(), Error> {
        required_mount_dir(options)?;
        let _guard = self.locks.lock(&options.volume).await;
        self.remove_pod_mount(options).await
    }

    /// Attach the volume to this node, unless it's attached already.
    pub async fn attach(&self, options: &AttachOptions) -> Result<AttachOptions, Error> {
        validate(options)?;
        let _guard = self.locks.lock(&options.volume).await;
        let (attachment, _) = self.ensure_attached(options).await?;
        Ok(attachment.attach_options(&options.mount_dir))
    }

    /// Detach the volume from this node.
    /// Detaching a volume which is not attached succeeds, without calling the backend.
    pub async fn detach(&self, options: &AttachOptions) -> Result<(), Error> {
        validate(options)?;
        let volume = &options.volume;
        let _guard = self.locks.lock(volume).await;
        let Some(attachment) = self.attachment(volume).await? else {
            info!(%volume, node = self.node_name(), "Volume is not attached");
            return Ok(());
        };
        if self.is_mounted(&attachment.global_mount_path).await? {
            return Err(Error::StillMounted {
                volume: volume.clone(),
                path: attachment.global_mount_path,
            });
        }
        self.detach_attached(volume).await
    }

    /// Mount the volume on the pod mount directory, attaching it and mounting its global
    /// mount path first if no other pod on this node uses it yet.
    pub async fn mount(&self, options: &AttachOptions) -> Result<AttachOptions, Error> {
        let mount_dir = required_mount_dir(options)?;
        let volume = &options.volume;
        let _guard = self.locks.lock(volume).await;

        let (attachment, attached) = self.ensure_attached(options).await?;
        let mut mounted_global = false;
        match self
            .mount_attached(&attachment, options, &mut mounted_global)
            .await
        {
            Ok(attachment) => {
                info!(%volume, mount_dir, pods = attachment.pod_mounts.len(), "Mounted volume");
                Ok(attachment.attach_options(mount_dir))
            }
            Err(error) => {
                error!(
                    %volume,
                    mount_dir,
                    attached,
                    error = error.full_string(),
                    "Failed to mount volume"
                );
                // only a failed mount is undone: any other failure leaves nothing to undo, or
                // no reliable view of the mount table to undo it with
                let unused = attachment.pod_mounts.keys().all(|dir| same_path(dir, mount_dir));
                if unused && error.kind() == ErrorKind::Mount {
                    self.rollback(&attachment, attached, mounted_global).await;
                }
                Err(error)
            }
        }
    }

    /// Unmount the pod mount directory. When it was the last reference to the volume on this
    /// node, the global mount path is unmounted and the volume detached as well.
    ///
    /// The pod mount directory is never left mounted when this succeeds.
    pub async fn unmount(&self, mount_dir: &str) -> Result<(), Error> {
        let options = self.attach_info_from_mount_dir(mount_dir).await?;
        let volume = &options.volume;
        let _guard = self.locks.lock(volume).await;

        let global_mount_path = self.global_mount_path(volume).await?;
        let refs = self.reference_snapshot(mount_dir, &global_mount_path).await?;
        info!(%volume, mount_dir, references = refs.len(), "Unmounting pod mount");

        self.unmount_path(mount_dir).await?;

        // The last pod mount is released rather than removed: the record keeps resolving it
        // until the volume is detached, so a retried unmount can finish the teardown.
        // A stale pod mount record is tolerated: it must not hold back the global unmount
        // and detach, which are retried by the kubelet if they fail.
        let last_reference = refs.is_last_reference(&global_mount_path);
        let recorded = match last_reference {
            true => self.release_pod_mount(&options).await,
            false => self.remove_pod_mount(&options).await,
        };
        if let Err(error) = recorded {
            warn!(
                %volume,
                mount_dir,
                error = error.full_string(),
                "Failed to remove the pod mount record"
            );
        }

        if !last_reference {
            info!(%volume, mount_dir, "Volume is still used by other pods");
            return Ok(());
        }

        self.unmount_path(&global_mount_path).await?;
        if let Err(error) = self
            .store
            .set_state(self.node_name(), volume, AttachmentState::Attached)
            .await
        {
            warn!(%volume, %error, "Failed to record the global unmount");
        }
        self.detach_attached(volume).await
    }

    /// Relay a message logged by a driver invocation.
    pub fn log(&self, message: &str, is_error: bool) {
        match is_error {
            true => error!(origin = "driver", "{message}"),
            false => info!(origin = "driver", "{message}"),
        }
    }

    /// List the attachment records of this node.
    pub async fn list_attachments(&self) -> Result<Vec<VolumeAttachment>, Error> {
        self.store
            .list(self.node_name())
            .await
            .context(error::ListAttachments { node: self.node() })
    }

    async fn attachment(&self, volume: &VolumeId) -> Result<Option<VolumeAttachment>, Error> {
        self.store
            .attachment(self.node_name(), volume)
            .await
            .context(error::Store { volume: volume.clone() })
    }

    async fn remove_pod_mount(&self, options: &AttachOptions) -> Result<(), Error> {
        self.store
            .remove_pod_mount(self.node_name(), &options.volume, &options.mount_dir)
            .await
            .context(error::Bookkeeping {
                volume: options.volume.clone(),
                mount_dir: &options.mount_dir,
            })
    }

    async fn release_pod_mount(&self, options: &AttachOptions) -> Result<(), Error> {
        self.store
            .release_pod_mount(self.node_name(), &options.volume, &options.mount_dir)
            .await
            .context(error::Bookkeeping {
                volume: options.volume.clone(),
                mount_dir: &options.mount_dir,
            })
    }

    /// Get the attachment record of the volume, attaching the volume first if there is none.
    /// Also returns whether the volume was attached by this call.
    async fn ensure_attached(
        &self,
        options: &AttachOptions,
    ) -> Result<(VolumeAttachment, bool), Error> {
        let volume = &options.volume;
        if let Some(attachment) = self.attachment(volume).await? {
            debug!(%volume, device = attachment.device_path, "Volume already attached");
            return Ok((attachment, false));
        }

        let device = self
            .backend
            .attach(volume, self.node_name())
            .await
            .context(error::Attach {
                volume: volume.clone(),
                node: self.node(),
            })?;
        let attachment = VolumeAttachment::new(
            volume.clone(),
            self.node(),
            device,
            self.global_mount_path_of(volume),
            &options.fs_type,
        );
        if let Err(source) = self.store.create(&attachment).await {
            if let Err(error) = self.backend.detach(volume, self.node_name()).await {
                error!(%volume, %error, "Failed to detach volume after failing to record it");
            }
            return Err(Error::Store {
                volume: volume.clone(),
                source,
            });
        }
        info!(%volume, device = attachment.device_path, "Attached volume");
        Ok((attachment, true))
    }

    /// Mount the global mount path if needed, then the pod mount directory.
    /// `mounted_global` is set once this call has mounted the global mount path.
    async fn mount_attached(
        &self,
        attachment: &VolumeAttachment,
        options: &AttachOptions,
        mounted_global: &mut bool,
    ) -> Result<VolumeAttachment, Error> {
        let volume = &attachment.volume;
        let global_mount_path = attachment.global_mount_path.as_str();
        let mount_dir = options.mount_dir.as_str();

        let refs = self.mount_refs(global_mount_path).await?;
        let pod_mounted = refs.iter().any(|r| same_path(r, mount_dir));
        if pod_mounted && attachment.references(mount_dir) {
            debug!(%volume, mount_dir, "Volume already mounted");
            return Ok(attachment.clone());
        }

        if refs.is_empty() {
            self.mount_path(
                &attachment.device_path,
                global_mount_path,
                MountOptions::filesystem(&attachment.fs_type),
            )
            .await?;
            *mounted_global = true;
            self.store
                .set_state(self.node_name(), volume, AttachmentState::GloballyMounted)
                .await
                .context(error::Store {
                    volume: volume.clone(),
                })?;
            info!(%volume, global_mount_path, "Mounted global mount path");
        }

        if !pod_mounted {
            self.mount_path(
                global_mount_path,
                mount_dir,
                MountOptions::bind(options.read_only),
            )
            .await?;
        }

        let pod_mount = PodMount {
            read_only: options.read_only,
        };
        let result = self
            .store
            .add_pod_mount(self.node_name(), volume, mount_dir, pod_mount)
            .await;
        match result {
            Ok(Some(attachment)) => Ok(attachment),
            Ok(None) => {
                self.undo_pod_mount(volume, mount_dir).await;
                Err(Error::GlobalMountPathNotFound {
                    node: self.node(),
                    volume: volume.clone(),
                })
            }
            Err(source) => {
                self.undo_pod_mount(volume, mount_dir).await;
                Err(Error::Bookkeeping {
                    volume: volume.clone(),
                    mount_dir: mount_dir.to_string(),
                    source,
                })
            }
        }
    }

    async fn undo_pod_mount(&self, volume: &VolumeId, mount_dir: &str) {
        if let Err(error) = self.unmount_path(mount_dir).await {
            error!(%volume, mount_dir, error = error.full_string(), "Failed to undo the pod mount");
        }
    }

    /// Tear down what a failed mount of an unused volume did itself: the global mount if
    /// it mounted it, and the attachment if it attached the volume.
    async fn rollback(&self, attachment: &VolumeAttachment, attached: bool, mounted_global: bool) {
        let volume = &attachment.volume;
        warn!(%volume, attached, mounted_global, "Rolling back a failed mount of an unused volume");
        if mounted_global {
            if let Err(error) = self.unmount_path(&attachment.global_mount_path).await {
                error!(%volume, error = error.full_string(), "Rollback failed");
                return;
            }
            if !attached {
                let state = AttachmentState::Attached;
                if let Err(error) = self.store.set_state(self.node_name(), volume, state).await {
                    warn!(%volume, %error, "Failed to record the global unmount");
                }
            }
        }
        if attached {
            if let Err(error) = self.detach_attached(volume).await {
                error!(%volume, error = error.full_string(), "Rollback failed");
            }
        }
    }

    /// Detach an attached volume and delete its record.
    async fn detach_attached(&self, volume: &VolumeId) -> Result<(), Error> {
        self.backend
            .detach(volume, self.node_name())
            .await
            .context(error::Detach {
                volume: volume.clone(),
                node: self.node(),
            })?;
        self.store
            .delete(self.node_name(), volume)
            .await
            .context(error::Store {
                volume: volume.clone(),
            })?;
        info!(%volume, node = self.node_name(), "Detached volume");
        Ok(())
    }

    /// Snapshot the references of the pod mount directory before it's unmounted.
    /// If it's not mounted anymore, the references of the global mount path are used.
    pub(crate) async fn reference_snapshot(
        &self,
        mount_dir: &str,
        global_mount_path: &str,
    ) -> Result<MountRefs, Error> {
        let mut refs = self.mount_refs(mount_dir).await?;
        if refs.is_empty() {
            debug!(mount_dir, "Pod mount is already gone");
            refs = self.mount_refs(global_mount_path).await?;
        }
        Ok(MountRefs::new(mount_dir, refs))
    }

    async fn mount_refs(&self, path: &str) -> Result<Vec<String>, Error> {
        let tracker = self.tracker.clone();
        let owned = path.to_string();
        blocking(move || tracker.mount_refs(&owned))
            .await
            .context(error::MountInspection { path })
    }

    async fn is_mounted(&self, path: &str) -> Result<bool, Error> {
        Ok(!self.mount_refs(path).await?.is_empty())
    }

    async fn mount_path(
        &self,
        from: &str,
        target: &str,
        options: MountOptions,
    ) -> Result<(), Error> {
        let mounter = self.mounter.clone();
        let (source, owned_target) = (from.to_string(), target.to_string());
        blocking(move || mounter.mount(&source, &owned_target, &options))
            .await
            .context(error::Mount { from, target })
    }

    async fn unmount_path(&self, path: &str) -> Result<(), Error> {
        let mounter = self.mounter.clone();
        let owned = path.to_string();
        blocking(move || mounter.unmount(&owned))
            .await
            .context(error::Unmount { path })
    }
}
