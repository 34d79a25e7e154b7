//! The attach/detach capability of the storage backend.
//!
//! The controller only ever needs to make a volume's block device appear on (or disappear
//! from) its own node, so any backend implementing [`VolumeBackend`] will do. The default
//! one drives the `rbd` command line tool.

use crate::attachment::VolumeId;
use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, trace};

/// Backend error variants.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum BackendError {
    #[snafu(display("Failed to execute '{binary}'"))]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[snafu(display("'{binary}' command failed: {stderr}"))]
    CommandFailed { binary: String, stderr: String },
    #[snafu(display("'{binary}' did not report the device path of the mapped image"))]
    NoDevicePath { binary: String },
}

/// Makes a volume's block device available on a node, and releases it.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Attach the volume to the node, returning the path of its block device.
    async fn attach(&self, volume: &VolumeId, node: &str) -> Result<String, BackendError>;
    /// Detach the volume from the node.
    async fn detach(&self, volume: &VolumeId, node: &str) -> Result<(), BackendError>;
}

/// Backend which maps and unmaps rbd images on the local node with the `rbd` tool.
#[derive(Debug, Clone)]
pub struct RbdBackend {
    binary: String,
    args: Vec<String>,
}

impl Default for RbdBackend {
    fn default() -> Self {
        Self::new("rbd", Vec::new())
    }
}

impl RbdBackend {
    /// Create a new `Self` using the given binary, which gets `args` before any subcommand,
    /// eg: `--id admin --conf /etc/ceph/ceph.conf`.
    pub fn new(binary: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }

    async fn run(&self, subcommand: &str, volume: &VolumeId) -> Result<Output, BackendError> {
        let output = Command::new(&self.binary)
            .args(&self.args)
            .arg(subcommand)
            .arg(volume.to_string())
            .output()
            .await
            .context(Spawn {
                binary: self.binary.clone(),
            })?;
        trace!(
            binary = %self.binary,
            subcommand,
            stdout = %String::from_utf8_lossy(&output.stdout),
            status = ?output.status.code(),
            "Command output"
        );
        Ok(output)
    }
}

/// Turn an unsuccessful command output into an error.
fn ack_command_output(output: Output, binary: &str) -> Result<Output, BackendError> {
    if output.status.success() {
        return Ok(output);
    }
    Err(BackendError::CommandFailed {
        binary: binary.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// The device path is the last `/dev/` line printed by `rbd map`.
fn device_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("/dev/"))
        .map(ToString::to_string)
}

#[async_trait]
impl VolumeBackend for RbdBackend {
    async fn attach(&self, volume: &VolumeId, node: &str) -> Result<String, BackendError> {
        let output = self.run("map", volume).await?;
        let output = ack_command_output(output, &self.binary)?;
        let device = device_path(&output.stdout).ok_or(BackendError::NoDevicePath {
            binary: self.binary.clone(),
        })?;
        debug!(%volume, node, device = %device, "Mapped rbd image");
        Ok(device)
    }

    async fn detach(&self, volume: &VolumeId, node: &str) -> Result<(), BackendError> {
        let output = self.run("unmap", volume).await?;
        match ack_command_output(output, &self.binary) {
            Ok(_) => {
                debug!(%volume, node, "Unmapped rbd image");
                Ok(())
            }
            // the image is already gone from this node
            Err(BackendError::CommandFailed { stderr, .. }) if stderr.contains("not mapped") => {
                debug!(%volume, node, "Rbd image was not mapped");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}
