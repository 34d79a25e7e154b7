use super::fakes::{volume, Harness, GLOBAL, NODE, P1, P2};
use crate::{
    attachment::AttachOptions,
    rpc::{bind_socket, ClientError, OperationClient, RpcServer},
    ErrorKind,
};
use std::{path::Path, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::oneshot,
    task::JoinHandle,
};

struct Agent {
    harness: Harness,
    client: OperationClient,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
}

fn start(socket: &Path) -> Agent {
    let harness = Harness::new();
    let listener = bind_socket(socket).unwrap();
    let server = RpcServer::new(harness.controller.clone());
    let (shutdown, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(server.serve(listener, async move {
        stopped.await.ok();
    }));
    Agent {
        harness,
        client: OperationClient::new(socket, Duration::from_secs(10)),
        shutdown,
        server,
    }
}

impl Agent {
    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        self.server.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn mount_and_unmount_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let agent = start(&dir.path().join("agent.sock"));
    let client = &agent.client;

    let options = AttachOptions::new(volume()).with_mount_dir(P1);
    let info = client.mount(&options).await.unwrap();
    assert_eq!(info.global_mount_path.as_deref(), Some(GLOBAL));
    client
        .mount(&AttachOptions::new(volume()).with_mount_dir(P2))
        .await
        .unwrap();

    let info = client.attach_info_from_mount_dir(P1).await.unwrap();
    assert_eq!(info.volume, volume());
    assert_eq!(info.node.as_deref(), Some(NODE));
    assert_eq!(client.global_mount_path(&volume()).await.unwrap(), GLOBAL);

    let attachments = client.list_attachments().await.unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].pod_mounts.len(), 2);

    client.unmount(P1).await.unwrap();
    assert_eq!(agent.harness.backend.detaches(), 0);
    client.unmount(P2).await.unwrap();
    assert_eq!(agent.harness.backend.detaches(), 1);

    client.detach(&AttachOptions::new(volume())).await.unwrap();
    client.detach(&AttachOptions::new(volume())).await.unwrap();
    assert_eq!(agent.harness.backend.detaches(), 1);
    assert!(client.list_attachments().await.unwrap().is_empty());

    client.log("driver message", false).await.unwrap();
    agent.stop().await;
}

#[tokio::test]
async fn remote_errors_keep_their_kind() {
    let dir = tempfile::tempdir().unwrap();
    let agent = start(&dir.path().join("agent.sock"));

    let error = agent.client.unmount(P1).await.unwrap_err();
    let reply = error.reply().unwrap();
    assert_eq!(reply.kind, ErrorKind::Resolution);
    assert!(reply.message.contains(P1), "{}", reply.message);

    let error = agent
        .client
        .attach_info_from_mount_dir(P1)
        .await
        .unwrap_err();
    assert_eq!(error.reply().map(|r| r.kind), Some(ErrorKind::Resolution));

    agent
        .client
        .remove_attachment_object(&AttachOptions::new(volume()).with_mount_dir(P1))
        .await
        .unwrap();
    agent.stop().await;
}

#[tokio::test]
async fn attach_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let agent = start(&dir.path().join("agent.sock"));

    let info = agent
        .client
        .attach(&AttachOptions::new(volume()))
        .await
        .unwrap();
    assert_eq!(info.device_path.as_deref(), Some("/dev/rbd0"));
    assert_eq!(agent.harness.backend.attaches(), 1);
    agent.stop().await;
}

#[tokio::test]
async fn malformed_request() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("agent.sock");
    let agent = start(&socket);

    let mut stream = UnixStream::connect(&socket).await.unwrap();
    stream.write_all(b"{\"method\":\"Format\"}").await.unwrap();
    stream.shutdown().await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();

    let response: crate::rpc::Response = serde_json::from_str(&reply).unwrap();
    match response {
        crate::rpc::Response::Error(error) => assert_eq!(error.kind, ErrorKind::InvalidArgument),
        other => panic!("unexpected response {other}"),
    }
    agent.stop().await;
}

#[tokio::test]
async fn stale_socket_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("run").join("agent.sock");
    std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
    std::fs::write(&socket, b"").unwrap();

    let agent = start(&socket);
    agent.client.log("hello", true).await.unwrap();
    agent.stop().await;
}

#[tokio::test]
async fn agent_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let client = OperationClient::new(dir.path().join("agent.sock"), Duration::from_secs(1));
    let error = client.unmount(P1).await.unwrap_err();
    assert!(matches!(error, ClientError::Connect { .. }), "{error}");
    assert!(error.reply().is_none());
}
