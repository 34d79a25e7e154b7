use super::message::{Request, Response};
use crate::{
    attachment::{AttachOptions, VolumeAttachment, VolumeId},
    error::ReplyError,
};
use snafu::{ResultExt, Snafu};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use tracing::trace;

/// Rpc client error variants.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub), context(suffix(false)))]
pub enum ClientError {
    #[snafu(display("Failed to connect to the agent on '{}'", socket.display()))]
    Connect {
        socket: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to send '{method}' to the agent"))]
    SendRequest {
        method: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to receive the reply of '{method}' from the agent"))]
    ReceiveReply {
        method: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to encode the '{method}' request"))]
    Encode {
        method: String,
        source: serde_json::Error,
    },
    #[snafu(display("Failed to decode the reply of '{method}'"))]
    Decode {
        method: String,
        source: serde_json::Error,
    },
    #[snafu(display("Timed out after {timeout:?} waiting for the reply of '{method}'"))]
    Timeout { method: String, timeout: Duration },
    #[snafu(display("Unexpected reply '{reply}' to '{method}'"))]
    UnexpectedReply { method: String, reply: String },
    #[snafu(display("{source}"))]
    Reply { source: ReplyError },
}

impl ClientError {
    /// The error reported by the agent, if that's what this is.
    pub fn reply(&self) -> Option<&ReplyError> {
        match self {
            ClientError::Reply { source } => Some(source),
            _ => None,
        }
    }
}

/// Issues calls to the agent. Each call uses its own connection, which is closed when the
/// call returns.
#[derive(Debug, Clone)]
pub struct OperationClient {
    socket: PathBuf,
    timeout: Duration,
}

impl OperationClient {
    /// Create a new `Self` for the agent listening on `socket`, waiting up to `timeout` for
    /// each call.
    pub fn new(socket: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            socket: socket.as_ref().to_path_buf(),
            timeout,
        }
    }

    /// Issue a single call and wait for its reply.
    /// An error reply from the agent is returned as `ClientError::Reply`.
    pub async fn call(&self, request: &Request) -> Result<Response, ClientError> {
        let method = request.method();
        match tokio::time::timeout(self.timeout, self.round_trip(request)).await {
            Ok(Ok(Response::Error(source))) => Err(ClientError::Reply { source }),
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout {
                method: method.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn round_trip(&self, request: &Request) -> Result<Response, ClientError> {
        let method = request.method();
        let payload = serde_json::to_vec(request).context(Encode { method })?;
        let mut stream = UnixStream::connect(&self.socket).await.context(Connect {
            socket: &self.socket,
        })?;
        stream.write_all(&payload).await.context(SendRequest { method })?;
        stream.shutdown().await.context(SendRequest { method })?;

        let mut reply = Vec::new();
        (&mut stream)
            .take(utils::MAX_RPC_FRAME_BYTES)
            .read_to_end(&mut reply)
            .await
            .context(ReceiveReply { method })?;
        let response = serde_json::from_slice(&reply).context(Decode { method })?;
        trace!(%request, %response, "Call completed");
        Ok(response)
    }

    fn unexpected(method: &str, response: Response) -> ClientError {
        ClientError::UnexpectedReply {
            method: method.to_string(),
            reply: response.to_string(),
        }
    }

    async fn call_ok(&self, request: Request) -> Result<(), ClientError> {
        match self.call(&request).await? {
            Response::Ok => Ok(()),
            response => Err(Self::unexpected(request.method(), response)),
        }
    }

    async fn call_attach_info(&self, request: Request) -> Result<AttachOptions, ClientError> {
        match self.call(&request).await? {
            Response::AttachInfo(options) => Ok(options),
            response => Err(Self::unexpected(request.method(), response)),
        }
    }

    /// Resolve a pod mount directory to the options of its volume.
    pub async fn attach_info_from_mount_dir(
        &self,
        mount_dir: &str,
    ) -> Result<AttachOptions, ClientError> {
        self.call_attach_info(Request::GetAttachInfoFromMountDir {
            mount_dir: mount_dir.to_string(),
        })
        .await
    }

    /// Get the global mount path of a volume attached to the node.
    pub async fn global_mount_path(&self, volume: &VolumeId) -> Result<String, ClientError> {
        let request = Request::GetGlobalMountPath {
            volume: volume.clone(),
        };
        match self.call(&request).await? {
            Response::GlobalMountPath(path) => Ok(path),
            response => Err(Self::unexpected(request.method(), response)),
        }
    }

    /// Remove a pod mount directory from its attachment record.
    pub async fn remove_attachment_object(
        &self,
        options: &AttachOptions,
    ) -> Result<(), ClientError> {
        self.call_ok(Request::RemoveAttachmentObject(options.clone()))
            .await
    }

    /// Attach a volume to the node.
    pub async fn attach(&self, options: &AttachOptions) -> Result<AttachOptions, ClientError> {
        self.call_attach_info(Request::Attach(options.clone())).await
    }

    /// Detach a volume from the node.
    pub async fn detach(&self, options: &AttachOptions) -> Result<(), ClientError> {
        self.call_ok(Request::Detach(options.clone())).await
    }

    /// Attach and mount a volume on a pod mount directory.
    pub async fn mount(&self, options: &AttachOptions) -> Result<AttachOptions, ClientError> {
        self.call_attach_info(Request::Mount(options.clone())).await
    }

    /// Unmount a pod mount directory.
    pub async fn unmount(&self, mount_dir: &str) -> Result<(), ClientError> {
        self.call_ok(Request::Unmount {
            mount_dir: mount_dir.to_string(),
        })
        .await
    }

    /// Log a message on the agent.
    pub async fn log(&self, message: &str, is_error: bool) -> Result<(), ClientError> {
        self.call_ok(Request::Log {
            message: message.to_string(),
            is_error,
        })
        .await
    }

    /// List the attachment records of the node.
    pub async fn list_attachments(&self) -> Result<Vec<VolumeAttachment>, ClientError> {
        match self.call(&Request::ListAttachments).await? {
            Response::Attachments(attachments) => Ok(attachments),
            response => Err(Self::unexpected("ListAttachments", response)),
        }
    }
}
