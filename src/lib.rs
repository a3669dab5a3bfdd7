//! A user-space RDMA request/response messaging fabric.
//!
//! The safe RDMA verbs wrapping lives in the [`rdma`] mod: devices, protection
//! domains, completion queues, queue pairs, memory regions. The fabric itself
//! is built on top of it, in the [`fabric`] mod: a TCP-bootstrapped pool of
//! worker threads, each driving a set of Reliable Connected queue pairs to
//! move request/response traffic with zero-copy buffers.
//!
//! [`fabric::ClientSession`] and [`fabric::ServerSession`] are the entry
//! points most callers want.
//!
//! **WARNING: The interfaces are unstable and up to change!**

#[cfg(not(target_os = "linux"))]
compile_error!("this crate currently only supports Linux");

/// Bindings of C interfaces.
pub mod bindings;

/// Shared utility functions.
mod utils;

/// RDMA functionalities.
/// Not to be publicly exposed, instead `pub use` necessary items.
mod rdma;

pub use rdma::context::*;
pub use rdma::cq::*;
pub use rdma::gid::*;
pub use rdma::mr::*;
pub use rdma::nic::*;
pub use rdma::pd::*;
pub use rdma::qp::*;
pub use rdma::wr::*;

/// Type aliases for RDMA identifiers (LIDs, QPNs, GID indices, ...).
pub use rdma::types;

/// The request/response messaging fabric.
pub mod fabric;
