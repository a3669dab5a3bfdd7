//! Type aliases for RDMA-related values that are otherwise easy to confuse
//! (all of them are integers at the FFI boundary).

/// A port's local identifier, assigned by the subnet manager.
pub type Lid = u16;

/// A 1-based physical port number on a device.
pub type PortNum = u8;

/// A queue pair's number, unique per device.
pub type Qpn = u32;

/// Index into a port's GID table.
pub type GidIndex = u8;

/// Work request identifier, round-tripped through completions verbatim.
pub type WrId = u64;

/// 32-bit immediate data carried by an RDMA send/write-with-immediate.
pub type ImmData = u32;

/// Packet sequence number for a reliable or unreliable-datagram QP.
pub type Psn = u32;

/// Queue key, used to authenticate unreliable-datagram sends.
pub type QKey = u32;
