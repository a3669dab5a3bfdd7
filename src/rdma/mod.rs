// RDMA contexts.
pub mod context;

// RDMA completion queues.
pub mod cq;

// RDMA devices and device lists.
pub mod device;

// RDMA device GIDs.
pub mod gid;

// Local RDMA memory regions.
pub mod mr;

// RDMA hardware discovery (devices, ports).
pub mod nic;

// RDMA protection domains.
pub mod pd;

// RDMA queue pairs.
pub mod qp;

// Type aliases for RDMA identifiers (LIDs, QPNs, GID indices, ...).
pub mod types;

// RDMA work requests.
pub mod wr;
