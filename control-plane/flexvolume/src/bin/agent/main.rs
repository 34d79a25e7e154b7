use clap::Parser;
use flexvolume::{
    backend::RbdBackend,
    controller::{AttachDetachController, ControllerConfig},
    install::install_driver,
    mount::{MountInfoTracker, SysMounter},
    rpc::{bind_socket, RpcServer},
    store::{AttachmentStore, PstorAttachmentStore},
};
use pstor::memory::MemStore;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use utils::tracing_telemetry::{FmtLayer, FmtStyle, TracingTelemetry};

/// The Cli arguments for this binary.
#[derive(Debug, Parser)]
#[clap(name = utils::package_description!(), version = utils::package_version!())]
pub(crate) struct CliArgs {
    /// The name of the node this agent manages.
    #[clap(long, env = "NODE_NAME")]
    pub(crate) node_name: String,

    /// The unix socket on which the driver requests are served.
    #[clap(long, default_value = utils::DEFAULT_AGENT_SOCKET)]
    pub(crate) socket: PathBuf,

    /// Directory under which the per-volume global mount paths are created.
    #[clap(long, default_value = utils::DEFAULT_GLOBAL_MOUNT_ROOT)]
    pub(crate) global_mount_root: PathBuf,

    /// The kubelet volume plugin directory in which the driver is installed on start-up.
    /// The driver is not installed when unset.
    #[clap(long, env = "FLEXVOLUME_DIR")]
    pub(crate) flexvolume_dir: Option<PathBuf>,

    /// The driver binary to install, defaults to the flexvolume binary next to the agent.
    #[clap(long, requires = "flexvolume_dir")]
    pub(crate) driver_binary: Option<PathBuf>,

    /// The attachment store url.
    /// memory:// keeps the records in memory, file://<path> persists them to a local file and,
    /// when built with etcd support, http(s)://<endpoint> uses etcd.
    #[clap(long, default_value = utils::DEFAULT_STORE_URL)]
    pub(crate) store: String,

    /// The timeout for every attachment store operation.
    #[clap(long, default_value = utils::STORE_OP_TIMEOUT)]
    pub(crate) store_timeout: humantime::Duration,

    /// The key prefix of the attachment records.
    #[clap(long, default_value = utils::DEFAULT_STORE_PREFIX)]
    pub(crate) store_prefix: String,

    /// The rbd binary used to map and unmap the volumes.
    #[clap(long, default_value = "rbd")]
    pub(crate) rbd_binary: String,

    /// Extra argument passed to every rbd command, eg: --rbd-arg=--id=admin.
    #[clap(long = "rbd-arg", allow_hyphen_values = true)]
    pub(crate) rbd_args: Vec<String>,

    /// Formatting style to be used while logging.
    #[clap(long, default_value = "pretty")]
    pub(crate) fmt_style: FmtStyle,

    /// Use ANSI colors for the logs.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub(crate) ansi_colours: bool,
}

impl CliArgs {
    fn args() -> Self {
        CliArgs::parse()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::args();

    TracingTelemetry::builder()
        .with_writer(FmtLayer::Stdout)
        .with_style(args.fmt_style)
        .with_colours(args.ansi_colours)
        .init("flexvolume-agent");
    utils::print_package_info!();
    info!(?args, "Agent configuration");

    if let Some(plugin_dir) = &args.flexvolume_dir {
        let binary = match &args.driver_binary {
            Some(binary) => binary.clone(),
            None => std::env::current_exe()?.with_file_name("flexvolume"),
        };
        install_driver(&binary, plugin_dir, utils::FLEXVOLUME_DRIVER_NAME)?;
    }

    let store = attachment_store(&args).await?;
    if !store.online().await {
        anyhow::bail!("The attachment store '{}' is not reachable", args.store);
    }
    let controller = AttachDetachController::new(
        ControllerConfig::new(&args.node_name).with_global_mount_root(&args.global_mount_root),
        store,
        Arc::new(RbdBackend::new(&args.rbd_binary, args.rbd_args.clone())),
        Arc::new(SysMounter::new()),
        Arc::new(MountInfoTracker::new()),
    );

    let listener = bind_socket(&args.socket)?;
    info!(socket = %args.socket.display(), node = %args.node_name, "Serving driver requests");
    RpcServer::new(controller)
        .serve(listener, shutdown_signal())
        .await?;

    if let Err(error) = std::fs::remove_file(&args.socket) {
        warn!(%error, socket = %args.socket.display(), "Failed to remove the agent socket");
    }
    info!("Agent stopped");
    Ok(())
}

/// Build the attachment store selected by the store url scheme.
async fn attachment_store(args: &CliArgs) -> anyhow::Result<Arc<dyn AttachmentStore>> {
    let timeout: Duration = args.store_timeout.into();
    let prefix = args.store_prefix.as_str();
    match args.store.split_once("://") {
        Some(("memory", _)) => {
            warn!("Attachment records are kept in memory only and are lost on restart");
            Ok(Arc::new(PstorAttachmentStore::new(
                MemStore::new(),
                prefix,
                timeout,
            )))
        }
        Some(("file", path)) => Ok(Arc::new(PstorAttachmentStore::new(
            MemStore::persistent(path)?,
            prefix,
            timeout,
        ))),
        #[cfg(feature = "etcd")]
        Some(("http" | "https", _)) => {
            let etcd = pstor::etcd::Etcd::new(&args.store, timeout).await?;
            Ok(Arc::new(PstorAttachmentStore::new(etcd, prefix, timeout)))
        }
        _ => anyhow::bail!("Unsupported attachment store url '{}'", args.store),
    }
}

/// Wait until the process receives a shutdown signal: either SIGINT or SIGTERM.
async fn shutdown_signal() {
    let (mut sig_int, mut sig_term) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(sig_int), Ok(sig_term)) => (sig_int, sig_term),
            (Err(error), _) | (_, Err(error)) => {
                error!(%error, "Failed to install the shutdown signal handlers");
                return std::future::pending().await;
            }
        };
    tokio::select! {
        _ = sig_int.recv() => warn!(signal = "SIGINT", "Signalled"),
        _ = sig_term.recv() => warn!(signal = "SIGTERM", "Signalled"),
    }
}
