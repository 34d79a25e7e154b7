/// Various common constants used by the flexvolume agent and driver.

/// Name of the flexvolume driver, as registered with the kubelet (`vendor~driver`).
pub const FLEXVOLUME_DRIVER_NAME: &str = "rook.io~rook";

/// Default unix socket the agent listens on and the driver connects to.
pub const DEFAULT_AGENT_SOCKET: &str = "/run/flexvolume/agent.sock";

/// Environment variable which overrides the agent socket path for the driver.
pub const AGENT_SOCKET_ENV: &str = "FLEXVOLUME_AGENT_SOCKET";

/// Default root under which per-volume global mount paths are created.
pub const DEFAULT_GLOBAL_MOUNT_ROOT: &str = "/var/lib/rook";

/// Default persistent store URL used by the agent.
pub const DEFAULT_STORE_URL: &str = "file:///var/lib/rook/flexvolume/attachments.json";

/// Default key prefix for attachment records in the persistent store.
pub const DEFAULT_STORE_PREFIX: &str = "/flexvolume/attachments";

/// The timeout for all persistent store operations.
pub const STORE_OP_TIMEOUT: &str = "5s";

/// Default timeout for a single driver to agent request.
/// Mount and unmount may block on slow syscalls, so keep this generous.
pub const DEFAULT_REQ_TIMEOUT: &str = "2m";

/// Number of times a conflicting compare-and-set update is retried.
pub const STORE_CAS_RETRIES: u32 = 5;

/// Default filesystem type when the kubelet does not provide one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Upper bound for a single RPC frame.
pub const MAX_RPC_FRAME_BYTES: u64 = 4 * 1024 * 1024;
