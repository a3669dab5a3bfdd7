//! Error types for the fabric layer.

use std::io;

use thiserror::Error;

use crate::rdma::cq::CqCreationError;
use crate::rdma::nic::{NicProbeError, PortQueryError};
use crate::rdma::qp::QpCreationError;

use super::wire::RecordType;

/// Errors from [`super::region::Region`] setup.
#[derive(Debug, Error)]
pub enum RegionError {
    /// Backing store allocation or registration failed.
    #[error("failed to allocate or register a buffer region")]
    Io(#[from] io::Error),

    /// `buf_count` or `buf_size` was zero.
    #[error("buffer region must have a positive buffer size and buffer count")]
    EmptyRegion,

    /// `align` was not a power of two, or zero.
    #[error("buffer alignment must be a nonzero power of two")]
    InvalidAlignment,
}

/// Errors from the TCP handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The TCP socket returned an I/O error.
    #[error("I/O error during handshake")]
    Io(#[from] io::Error),

    /// A handshake record read fewer or more bytes than `size_of::<ConnectInfo>()`.
    #[error("short handshake read: expected {expected} bytes, got {got}")]
    ShortRead {
        /// Expected byte count.
        expected: usize,
        /// Bytes actually read.
        got: usize,
    },

    /// The peer sent a record with an unexpected `type` tag.
    #[error("unexpected handshake record type: expected {expected:?}, got {got}")]
    UnexpectedType {
        /// The record type this side expected.
        expected: RecordType,
        /// The raw tag value actually received.
        got: u32,
    },

    /// TCP connect failed after exhausting the configured retry budget.
    #[error("exhausted {0} connection retries")]
    RetriesExhausted(u32),
}

/// The umbrella error type for [`super::context::FabricContext`] setup and
/// the session façades built on top of it.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Hardware discovery (device/port probing) failed.
    #[error(transparent)]
    Nic(#[from] NicProbeError),

    /// Port attribute query failed.
    #[error("port query failed")]
    Port(#[from] PortQueryError),

    /// Buffer region setup failed.
    #[error(transparent)]
    Region(#[from] RegionError),

    /// Completion queue creation failed.
    #[error(transparent)]
    Cq(#[from] CqCreationError),

    /// Queue pair creation failed.
    #[error(transparent)]
    Qp(#[from] QpCreationError),

    /// The TCP handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// A generic I/O error (device open, PD alloc, TCP bind/listen).
    #[error(transparent)]
    Io(#[from] io::Error),

    /// `pick_endpoint` found no endpoint bound to the requested destination.
    #[error("no endpoint available toward destination {0}")]
    NoRoute(String),
}
