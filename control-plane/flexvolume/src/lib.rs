#![warn(missing_docs)]
//! Node-local volume attachment lifecycle management for flexvolume drivers.
//!
//! The agent runs the [`controller::AttachDetachController`] of its node behind an rpc
//! server, and the short-lived driver invoked by the kubelet issues one call to it per
//! callback.

/// The attachment data model.
pub mod attachment;
/// The attach/detach capability of the storage backend.
pub mod backend;
/// The attach/detach controller.
pub mod controller;
/// Controller errors.
pub mod error;
/// Installation of the driver in the kubelet volume plugin directory.
pub mod install;
/// Per-volume serialization of operations.
pub mod limiter;
/// Mount capabilities of the host.
pub mod mount;
/// The rpc contract between the driver and the agent.
pub mod rpc;
/// Durable attachment records.
pub mod store;

pub use error::{Error, ErrorKind, ReplyError};

#[cfg(test)]
mod tests;
