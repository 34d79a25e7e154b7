//! The persistent stor is an interface to a datastore which suits the projects needs.
//! We may have various implementations, depending on where we're running.

/// Error exposed by the pstor.
pub mod error;
/// Export error module.
pub use error::Error;

/// The stor interface.
mod api;
/// Export pstor module.
pub use api::{Revision, Store, StoreKey, StoreKv, StoreValue, Versioned};

/// A particular implementation of the persistent store, using ETCd.
#[cfg(feature = "etcd")]
pub mod etcd;
/// An in-process store, optionally persisted to a local file.
pub mod memory;
