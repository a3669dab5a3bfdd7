//! Fabric configuration, loaded from a TOML file or built programmatically.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// All tunables named in the configuration surface.
///
/// Every field has a default matching the literal values used in the
/// end-to-end scenarios: `sbuf_size = 1024`, `ioengine_num = 2`, `cq_num = 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RDMA device name prefix to open (empty matches the first device).
    pub dev: String,

    /// Local GID index.
    pub gid: u8,

    /// TCP port for the handshake server.
    pub port: u16,

    /// Number of IO engines (worker threads).
    pub ioengine_num: usize,

    /// Completion queues per engine.
    pub cq_num: usize,

    /// Completion queue capacity.
    pub cq_depth: u32,

    /// Send buffer size, in bytes. Also the data-plane MTU.
    pub sbuf_size: usize,

    /// Recv buffer size, in bytes.
    pub rbuf_size: usize,

    /// Buffers per region (applies to both send and recv regions).
    pub buf_num: usize,

    /// Buffer alignment, in bytes. Must be a power of two.
    pub memalign: usize,

    /// Send work-queue depth.
    pub send_wq_depth: u32,

    /// Recv work-queue depth.
    pub recv_wq_depth: u32,

    /// Number of recvs pre-posted per endpoint at activation.
    pub recv_batch: usize,

    /// QPs per peer per engine.
    pub qp_num: usize,

    /// (server) expected number of peers.
    pub host_num: usize,

    /// Periodic throughput reporting toggle.
    pub print_thp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev: String::new(),
            gid: 0,
            port: 9527,
            ioengine_num: 2,
            cq_num: 1,
            cq_depth: 128,
            sbuf_size: 1024,
            rbuf_size: 1024,
            buf_num: 128,
            memalign: 64,
            send_wq_depth: 128,
            recv_wq_depth: 128,
            recv_batch: 16,
            qp_num: 1,
            host_num: 1,
            print_thp: false,
        }
    }
}

impl Config {
    /// Load a configuration from a TOML file, under a `[fabric]` table.
    /// Fields absent from the file fall back to [`Config::default`].
    pub fn load_toml(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse a configuration from a TOML string, under a `[fabric]` table.
    pub fn from_toml_str(text: &str) -> io::Result<Self> {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(default)]
            fabric: Config,
        }
        let wrapper: Wrapper = toml::from_str(text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(wrapper.fabric)
    }

    /// The data-plane MTU: the send buffer size, which doubles as the
    /// packet size limit (header included).
    #[inline]
    pub fn mtu(&self) -> usize {
        self.sbuf_size
    }

    /// Maximum payload bytes that fit after the fixed 20-byte header.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.sbuf_size.saturating_sub(super::wire::HEADER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_scenario_literals() {
        let cfg = Config::default();
        assert_eq!(cfg.sbuf_size, 1024);
        assert_eq!(cfg.ioengine_num, 2);
        assert_eq!(cfg.cq_num, 1);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = Config::from_toml_str("[fabric]\nport = 9000\n").unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.sbuf_size, 1024);
    }

    #[test]
    fn max_payload_leaves_room_for_the_header() {
        let mut cfg = Config::default();
        cfg.sbuf_size = 256;
        assert_eq!(cfg.max_payload(), 256 - super::super::wire::HEADER_SIZE);
    }
}
