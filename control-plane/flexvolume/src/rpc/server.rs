use super::message::{Request, Response};
use crate::{
    controller::AttachDetachController,
    error::{ErrorKind, ReplyError},
};
use std::{
    fs,
    future::Future,
    io::{self, ErrorKind as IoErrorKind},
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::Arc,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    task::JoinSet,
};
use tracing::{debug, error, info, trace, warn};

/// Bind the agent's unix socket, replacing a stale socket left by a previous instance.
pub fn bind_socket(socket: &Path) -> io::Result<UnixListener> {
    match fs::remove_file(socket) {
        Ok(_) => info!(socket = %socket.display(), "Removed stale socket"),
        Err(error) if error.kind() == IoErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket)?;
    info!(socket = %socket.display(), "Agent bound to socket");

    // Drivers are executed by the kubelet, which may run them as any user.
    if let Err(error) = fs::set_permissions(socket, fs::Permissions::from_mode(0o777)) {
        error!(%error, "Failed to change permissions of the socket");
    } else {
        debug!("Successfully changed file permissions of the socket");
    }
    Ok(listener)
}

/// Serves the controller's methods over a unix socket, one request per connection.
#[derive(Debug, Clone)]
pub struct RpcServer {
    controller: Arc<AttachDetachController>,
}

impl RpcServer {
    /// Create a new `Self` serving the given controller.
    pub fn new(controller: AttachDetachController) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }

    /// Accept connections until `shutdown` completes, then wait for the in-flight requests.
    pub async fn serve(
        self,
        listener: UnixListener,
        shutdown: impl Future<Output = ()>,
    ) -> io::Result<()> {
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(in_flight = connections.len(), "Shutting down the rpc server");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let server = self.clone();
                        connections.spawn(async move {
                            if let Err(error) = server.handle(stream).await {
                                warn!(%error, "Failed to serve connection");
                            }
                        });
                    }
                    Err(error) => error!(%error, "Failed to accept connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        while connections.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle(&self, mut stream: UnixStream) -> io::Result<()> {
        let mut payload = Vec::new();
        (&mut stream)
            .take(utils::MAX_RPC_FRAME_BYTES)
            .read_to_end(&mut payload)
            .await?;
        let response = match serde_json::from_slice::<Request>(&payload) {
            Ok(request) => self.dispatch(request).await,
            Err(error) => {
                warn!(%error, "Received a malformed request");
                Response::Error(ReplyError::new(
                    ErrorKind::InvalidArgument,
                    format!("malformed request: {error}"),
                ))
            }
        };
        let payload = serde_json::to_vec(&response)?;
        stream.write_all(&payload).await?;
        stream.shutdown().await
    }

    /// Invoke the controller method the request names.
    pub async fn dispatch(&self, request: Request) -> Response {
        let audit = !matches!(request, Request::Log { .. });
        if audit {
            info!(%request, "Received request");
        }
        let controller = &self.controller;
        let result = match &request {
            Request::GetAttachInfoFromMountDir { mount_dir } => controller
                .attach_info_from_mount_dir(mount_dir)
                .await
                .map(Response::AttachInfo),
            Request::GetGlobalMountPath { volume } => controller
                .global_mount_path(volume)
                .await
                .map(Response::GlobalMountPath),
            Request::RemoveAttachmentObject(options) => controller
                .remove_attachment_object(options)
                .await
                .map(|_| Response::Ok),
            Request::Detach(options) => controller.detach(options).await.map(|_| Response::Ok),
            Request::Attach(options) => controller.attach(options).await.map(Response::AttachInfo),
            Request::Mount(options) => controller.mount(options).await.map(Response::AttachInfo),
            Request::Unmount { mount_dir } => {
                controller.unmount(mount_dir).await.map(|_| Response::Ok)
            }
            Request::Log { message, is_error } => {
                controller.log(message, *is_error);
                Ok(Response::Ok)
            }
            Request::ListAttachments => controller
                .list_attachments()
                .await
                .map(Response::Attachments),
        };
        match result {
            Ok(response) => {
                match audit {
                    true => info!(%request, %response, "Request completed"),
                    false => trace!(%request, "Request completed"),
                }
                response
            }
            Err(error) => {
                error!(%request, error = error.full_string(), "Request failed");
                Response::Error(error.into())
            }
        }
    }
}
