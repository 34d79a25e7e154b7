use crate::{options::DriverOptions, status::DriverStatus, Operation};
use flexvolume::{
    attachment::{AttachOptions, VolumeId},
    rpc::OperationClient,
};
use tracing::{debug, error, info};

/// Runs the kubelet calls against the node agent.
#[derive(Debug)]
pub(crate) struct Driver {
    client: OperationClient,
}

impl Driver {
    pub(crate) fn new(client: OperationClient) -> Self {
        Self { client }
    }

    /// Run the operation, reporting its outcome as the kubelet expects it.
    pub(crate) async fn run(&self, operation: Operation) -> DriverStatus {
        let result = match operation {
            Operation::Init => Ok(DriverStatus::initialised()),
            Operation::Attach { options, node } => self.attach(&options, node.as_deref()).await,
            Operation::Detach { volume, node } => self.detach(&volume, node.as_deref()).await,
            Operation::Mount { mount_dir, options } => self.mount(&mount_dir, &options).await,
            Operation::Unmount { mount_dir } => self.unmount(&mount_dir).await,
            Operation::Unsupported(args) => {
                let call = args.first().map(String::as_str).unwrap_or_default();
                debug!(call, "Unsupported driver call");
                return DriverStatus::not_supported(format!("'{call}' is not supported"));
            }
        };
        result.unwrap_or_else(DriverStatus::failure)
    }

    /// Log locally and relay to the agent, so the message ends up in the agent's logs.
    /// The relay is best-effort.
    async fn relay(&self, message: &str, is_error: bool) {
        if is_error {
            error!("{message}");
        } else {
            info!("{message}");
        }
        if let Err(error) = self.client.log(message, is_error).await {
            debug!(%error, "Failed to relay the message to the agent");
        }
    }

    /// Relay the failure and turn it into the status message.
    async fn failed(&self, message: String) -> String {
        self.relay(&message, true).await;
        message
    }

    async fn attach(&self, options: &str, node: Option<&str>) -> Result<DriverStatus, String> {
        let options = attach_options(options)?;
        let volume = &options.volume;
        self.relay(&format!("attaching volume {volume} to node {node:?}"), false)
            .await;
        match self.client.attach(&options).await {
            Ok(info) => {
                self.relay(&format!("volume {volume} has been attached"), false)
                    .await;
                Ok(DriverStatus::success().with_device(info.device_path))
            }
            Err(error) => Err(self
                .failed(format!("Attach volume {volume} failed: {error}"))
                .await),
        }
    }

    async fn detach(&self, volume: &str, node: Option<&str>) -> Result<DriverStatus, String> {
        let volume = volume.parse::<VolumeId>()?;
        self.relay(&format!("detaching volume {volume} from node {node:?}"), false)
            .await;
        match self.client.detach(&AttachOptions::new(volume.clone())).await {
            Ok(()) => Ok(DriverStatus::success()
                .with_message(format!("volume {volume} has been detached"))),
            Err(error) => Err(self
                .failed(format!("Detach volume {volume} failed: {error}"))
                .await),
        }
    }

    async fn mount(&self, mount_dir: &str, options: &str) -> Result<DriverStatus, String> {
        let options = attach_options(options)?.with_mount_dir(mount_dir);
        let volume = &options.volume;
        self.relay(&format!("mounting volume {volume} on {mount_dir}"), false)
            .await;
        match self.client.mount(&options).await {
            Ok(_) => {
                self.relay(&format!("volume {volume} has been mounted on {mount_dir}"), false)
                    .await;
                Ok(DriverStatus::success())
            }
            Err(error) => Err(self
                .failed(format!("Mount volume {volume} on {mount_dir} failed: {error}"))
                .await),
        }
    }

    async fn unmount(&self, mount_dir: &str) -> Result<DriverStatus, String> {
        self.relay(&format!("unmounting mount dir: {mount_dir}"), false)
            .await;
        match self.client.unmount(mount_dir).await {
            Ok(()) => {
                self.relay(&format!("volume has been unmounted from {mount_dir}"), false)
                    .await;
                Ok(DriverStatus::success())
            }
            Err(error) => Err(self
                .failed(format!("Unmount volume at mount dir {mount_dir} failed: {error}"))
                .await),
        }
    }
}

fn attach_options(options: &str) -> Result<AttachOptions, String> {
    options
        .parse::<DriverOptions>()
        .map_err(|error| format!("Invalid driver options: {error}"))?
        .attach_options()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use flexvolume::{
        rpc::{Request, Response},
        ErrorKind, ReplyError,
    };
    use parking_lot::Mutex;
    use std::{path::Path, sync::Arc, time::Duration};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::UnixListener,
    };

    const MOUNT_DIR: &str = "/var/lib/kubelet/pods/p1/volumes/rook.io~rook/pvc-1";
    const OPTIONS: &str = r#"{"pool":"replicapool","image":"pvc-1","kubernetes.io/fsType":"xfs"}"#;

    /// An agent which records the requests and replies with canned responses.
    fn fake_agent(socket: &Path, busy: bool) -> Arc<Mutex<Vec<Request>>> {
        let requests = Arc::new(Mutex::new(vec![]));
        let listener = UnixListener::bind(socket).unwrap();
        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut payload = vec![];
                stream.read_to_end(&mut payload).await.unwrap();
                let request: Request = serde_json::from_slice(&payload).unwrap();
                let response = match &request {
                    _ if busy && !matches!(request, Request::Log { .. }) => {
                        Response::Error(ReplyError::new(ErrorKind::Unmount, "target is busy"))
                    }
                    Request::Attach(options) | Request::Mount(options) => {
                        let mut info = options.clone();
                        info.device_path = Some("/dev/rbd0".to_string());
                        Response::AttachInfo(info)
                    }
                    _ => Response::Ok,
                };
                recorded.lock().push(request);
                let reply = serde_json::to_vec(&response).unwrap();
                stream.write_all(&reply).await.unwrap();
                stream.shutdown().await.ok();
            }
        });
        requests
    }

    fn driver(socket: &Path) -> Driver {
        Driver::new(OperationClient::new(socket, Duration::from_secs(5)))
    }

    fn calls(requests: &Mutex<Vec<Request>>) -> Vec<Request> {
        requests
            .lock()
            .iter()
            .filter(|request| !matches!(request, Request::Log { .. }))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn mount_and_unmount() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let requests = fake_agent(&socket, false);
        let driver = driver(&socket);

        let status = driver
            .run(Operation::Mount {
                mount_dir: MOUNT_DIR.to_string(),
                options: OPTIONS.to_string(),
            })
            .await;
        assert_eq!(status.status(), Status::Success, "{status:?}");

        let status = driver
            .run(Operation::Unmount {
                mount_dir: MOUNT_DIR.to_string(),
            })
            .await;
        assert_eq!(status.status(), Status::Success, "{status:?}");

        let expected = AttachOptions::new(VolumeId::new("replicapool", "pvc-1"))
            .with_fs_type("xfs")
            .with_mount_dir(MOUNT_DIR);
        assert_eq!(
            calls(&requests),
            vec![
                Request::Mount(expected),
                Request::Unmount {
                    mount_dir: MOUNT_DIR.to_string()
                }
            ]
        );
        assert!(requests
            .lock()
            .iter()
            .any(|request| matches!(request, Request::Log { .. })));
    }

    #[tokio::test]
    async fn attach_reports_the_device() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        let requests = fake_agent(&socket, false);
        let driver = driver(&socket);

        let status = driver
            .run(Operation::Attach {
                options: OPTIONS.to_string(),
                node: Some("n1".to_string()),
            })
            .await;
        assert_eq!(
            status.to_json(),
            r#"{"status":"Success","device":"/dev/rbd0"}"#
        );

        let status = driver
            .run(Operation::Detach {
                volume: "replicapool/pvc-1".to_string(),
                node: None,
            })
            .await;
        assert_eq!(status.status(), Status::Success, "{status:?}");
        assert_eq!(calls(&requests).len(), 2);
    }

    #[tokio::test]
    async fn agent_failure() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("agent.sock");
        fake_agent(&socket, true);

        let status = driver(&socket)
            .run(Operation::Unmount {
                mount_dir: MOUNT_DIR.to_string(),
            })
            .await;
        assert_eq!(status.status(), Status::Failure);
        assert_eq!(status.exit_code(), 1);
        assert!(status.to_json().contains("target is busy"), "{status:?}");
    }

    #[tokio::test]
    async fn agent_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let status = driver(&dir.path().join("agent.sock"))
            .run(Operation::Unmount {
                mount_dir: MOUNT_DIR.to_string(),
            })
            .await;
        assert_eq!(status.status(), Status::Failure);
    }

    #[tokio::test]
    async fn local_calls() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir.path().join("agent.sock"));

        assert_eq!(
            driver.run(Operation::Init).await,
            DriverStatus::initialised()
        );
        let status = driver
            .run(Operation::Unsupported(vec!["getvolumename".to_string()]))
            .await;
        assert_eq!(status.status(), Status::NotSupported);

        let status = driver
            .run(Operation::Mount {
                mount_dir: MOUNT_DIR.to_string(),
                options: "{".to_string(),
            })
            .await;
        assert_eq!(status.status(), Status::Failure);

        let status = driver
            .run(Operation::Detach {
                volume: "pvc-1".to_string(),
                node: None,
            })
            .await;
        assert_eq!(status.status(), Status::Failure);
    }
}
