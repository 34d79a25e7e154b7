use crate::{attachment::VolumeId, backend::BackendError};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::error::Error as StdError;

/// Attach/detach controller error variants.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum Error {
    #[snafu(display("No attachment found for mount dir '{mount_dir}' on node '{node}'"))]
    MountDirNotFound { node: String, mount_dir: String },
    #[snafu(display("No global mount path found for volume '{volume}' on node '{node}'"))]
    GlobalMountPathNotFound { node: String, volume: VolumeId },
    #[snafu(display("Failed to inspect the mount references of '{path}'"))]
    MountInspection {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to mount '{from}' on '{target}'"))]
    Mount {
        from: String,
        target: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to unmount '{path}'"))]
    Unmount {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("Volume '{volume}' is still mounted on '{path}', refusing to detach"))]
    StillMounted { volume: VolumeId, path: String },
    #[snafu(display("Failed to attach volume '{volume}' to node '{node}'"))]
    Attach {
        volume: VolumeId,
        node: String,
        source: BackendError,
    },
    #[snafu(display("Failed to detach volume '{volume}' from node '{node}'"))]
    Detach {
        volume: VolumeId,
        node: String,
        source: BackendError,
    },
    #[snafu(display("Failed to update the pod mount '{mount_dir}' of volume '{volume}'"))]
    Bookkeeping {
        volume: VolumeId,
        mount_dir: String,
        source: pstor::Error,
    },
    #[snafu(display("Failed to access the attachment record of volume '{volume}'"))]
    Store {
        volume: VolumeId,
        source: pstor::Error,
    },
    #[snafu(display("Failed to list the attachments of node '{node}'"))]
    ListAttachments { node: String, source: pstor::Error },
    #[snafu(display("Invalid argument: {message}"))]
    InvalidArgument { message: String },
}

/// The category of an [`Error`], which is what callers use to decide how to react.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::AsRefStr,
    strum_macros::Display,
)]
pub enum ErrorKind {
    /// An attachment record or global mount path was not found.
    Resolution,
    /// The mount table could not be read.
    MountInspection,
    /// A mount operation failed.
    Mount,
    /// An unmount operation failed.
    Unmount,
    /// The backend failed to attach the volume.
    Attach,
    /// The backend failed to detach the volume.
    Detach,
    /// A pod mount record could not be updated.
    Bookkeeping,
    /// The attachment store could not be accessed.
    Store,
    /// The request is malformed.
    InvalidArgument,
    /// Anything else, including transport failures.
    Internal,
}

impl Error {
    /// Get the `ErrorKind` of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MountDirNotFound { .. } | Error::GlobalMountPathNotFound { .. } => {
                ErrorKind::Resolution
            }
            Error::MountInspection { .. } => ErrorKind::MountInspection,
            Error::Mount { .. } => ErrorKind::Mount,
            Error::Unmount { .. } => ErrorKind::Unmount,
            Error::Attach { .. } => ErrorKind::Attach,
            Error::Detach { .. } | Error::StillMounted { .. } => ErrorKind::Detach,
            Error::Bookkeeping { .. } => ErrorKind::Bookkeeping,
            Error::Store { .. } | Error::ListAttachments { .. } => ErrorKind::Store,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
        }
    }
    /// The error message along with all of its sources.
    pub fn full_string(&self) -> String {
        let mut message = self.to_string();
        let mut source = StdError::source(self);
        while let Some(error) = source {
            message.push_str(&format!(": {error}"));
            source = StdError::source(error);
        }
        message
    }
}

/// An error as it travels across the rpc boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyError {
    /// The error category.
    pub kind: ErrorKind,
    /// Human readable description, including the error sources.
    pub message: String,
}

impl ReplyError {
    /// Create a new `Self` from its parts.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for ReplyError {}

impl From<&Error> for ReplyError {
    fn from(error: &Error) -> Self {
        Self::new(error.kind(), error.full_string())
    }
}

impl From<Error> for ReplyError {
    fn from(error: Error) -> Self {
        Self::from(&error)
    }
}
