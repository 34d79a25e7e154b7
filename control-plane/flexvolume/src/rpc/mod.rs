//! Local request/response channel between the driver and the agent.

mod client;
mod message;
mod server;

pub use client::{ClientError, OperationClient};
pub use message::{Request, Response};
pub use server::{bind_socket, RpcServer};
