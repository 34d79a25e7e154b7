use clap::{Parser, Subcommand};
use flexvolume::rpc::OperationClient;
use std::path::PathBuf;
use utils::tracing_telemetry::{FmtLayer, FmtStyle, TracingTelemetry};

mod driver;
mod options;
mod status;

use driver::Driver;
use status::DriverStatus;

/// The kubelet flexvolume driver. Every call is forwarded to the node agent and its outcome is
/// printed on stdout as a json status document.
#[derive(Debug, Parser)]
#[clap(name = utils::package_description!(), version = utils::package_version!())]
struct CliArgs {
    /// The unix socket of the node agent.
    #[clap(
        long,
        global = true,
        env = utils::AGENT_SOCKET_ENV,
        default_value = utils::DEFAULT_AGENT_SOCKET
    )]
    socket: PathBuf,

    /// The timeout for each request to the node agent.
    #[clap(long, global = true, default_value = utils::DEFAULT_REQ_TIMEOUT)]
    timeout: humantime::Duration,

    #[clap(subcommand)]
    operation: Operation,
}

/// The calls the kubelet makes.
#[derive(Debug, Subcommand)]
pub(crate) enum Operation {
    /// Initialise the driver and report its capabilities.
    Init,
    /// Attach the volume to the node.
    Attach {
        /// The json options of the volume.
        options: String,
        /// The node to attach the volume to.
        node: Option<String>,
    },
    /// Detach the volume, given as pool/image, from the node.
    Detach {
        /// The volume, as pool/image.
        volume: String,
        /// The node to detach the volume from.
        node: Option<String>,
    },
    /// Mount the volume on the pod mount directory.
    Mount {
        /// The pod mount directory.
        mount_dir: String,
        /// The json options of the volume.
        options: String,
    },
    /// Unmount the pod mount directory.
    Unmount {
        /// The pod mount directory.
        mount_dir: String,
    },
    #[clap(external_subcommand)]
    Unsupported(Vec<String>),
}

impl CliArgs {
    /// Parse the arguments, reporting a usage error as a failed call.
    fn args() -> Result<Self, DriverStatus> {
        match CliArgs::try_parse() {
            Ok(args) => Ok(args),
            Err(error) if !error.use_stderr() => error.exit(),
            Err(error) => Err(DriverStatus::failure(error.to_string())),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // stdout is reserved for the status document
    TracingTelemetry::builder()
        .with_writer(FmtLayer::Stderr)
        .with_style(FmtStyle::Compact)
        .with_colours(false)
        .init(utils::FLEXVOLUME_DRIVER_NAME);

    let status = match CliArgs::args() {
        Ok(args) => {
            let client = OperationClient::new(&args.socket, args.timeout.into());
            Driver::new(client).run(args.operation).await
        }
        Err(status) => status,
    };
    println!("{}", status.to_json());
    std::process::exit(status.exit_code());
}
