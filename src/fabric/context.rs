//! Bootstrap: NIC discovery, engine construction, and the TCP handshake
//! that wires up RC queue pairs between this process and its peers.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::rdma::gid::Gid;
use crate::rdma::nic::{Nic, NicFinder, Port};
use crate::rdma::pd::Pd;
use crate::rdma::qp::QpEndpoint;

use super::config::Config;
use super::engine::{IoEngine, Role};
use super::error::{FabricError, HandshakeError};
use super::host::Host;
use super::wire::{ConnectBody, ConnectInfo, RecordType};

/// TCP connect retries before giving up on a peer.
const MAX_CONN_RETRY: u32 = 10;

/// The device, protection domain, engine pool, and host registry shared by
/// one client or server session.
pub struct FabricContext {
    pd: Pd,
    port: Port,
    cfg: Config,
    engines: Vec<Arc<IoEngine>>,
    hosts: Mutex<Vec<Host>>,
}

impl FabricContext {
    /// Probe a NIC matching `cfg.dev`/`cfg.gid`, allocate a PD, and build
    /// `cfg.ioengine_num` engines, each given the role produced by
    /// `make_role` (called once per engine).
    pub fn new(cfg: Config, make_role: impl Fn() -> Role) -> Result<Self, FabricError> {
        let nic = Self::probe(&cfg)?;
        let port = nic
            .ports
            .into_iter()
            .next()
            .ok_or(FabricError::Nic(crate::rdma::nic::NicProbeError::NotFound))?;
        let pd = Pd::new(&nic.context)?;

        let engines = (0..cfg.ioengine_num)
            .map(|_| IoEngine::new(&pd, cfg.clone(), make_role()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "fabric context ready: dev port {}, {} engines",
            port.num(),
            engines.len()
        );

        Ok(Self {
            pd,
            port,
            cfg,
            engines,
            hosts: Mutex::new(Vec::new()),
        })
    }

    fn probe(cfg: &Config) -> Result<Nic, FabricError> {
        let mut finder = NicFinder::new();
        if !cfg.dev.is_empty() {
            finder = finder.dev_name(&cfg.dev);
        }
        Ok(finder.probe()?)
    }

    /// This context's engines, in construction order.
    pub fn engines(&self) -> &[Arc<IoEngine>] {
        &self.engines
    }

    /// The GID this context binds QPs to.
    fn local_gid(&self) -> Gid {
        let (gid, _) = self.port.recommended_gid();
        gid.gid
    }

    /// IPv4 address derived from the last four bytes of the local GID, used
    /// only for human-readable identification and the channel's destination
    /// key.
    fn local_ip(&self) -> Ipv4Addr {
        ip_from_gid(&self.local_gid())
    }

    /// Run the client side of the handshake against a server listening at
    /// `addr`, wiring up `cfg.qp_num * ioengine_num` QPs round-robined
    /// engine-then-CQ, and registering the resulting endpoints as routes
    /// toward the server's derived IP.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), FabricError> {
        let mut stream = Self::connect_with_retry(addr)?;
        stream.set_nodelay(true).ok();

        let number_of_qp = (self.cfg.qp_num * self.engines.len()) as u32;
        let local_gid = self.local_gid();

        let host_rec = ConnectInfo::host(local_gid, number_of_qp);
        write_record(&mut stream, &host_rec)?;
        let peer_host = read_record(&mut stream, RecordType::HostInfo)?;
        let (peer_gid, peer_qp_count) = match peer_host.body {
            ConnectBody::Host { gid, number_of_qp } => (gid, number_of_qp),
            _ => unreachable!("read_record validated the type tag"),
        };

        let mut host = Host::new(peer_gid);
        let dest_ip = ip_from_gid(&peer_gid);

        let n = number_of_qp.min(peer_qp_count);
        for i in 0..n {
            let engine_idx = (i as usize) % self.engines.len();
            let engine = &self.engines[engine_idx];

            let (local_idx, local_ep) = engine.create_endpoint(&self.port)?;

            let channel_rec = ConnectInfo::channel(local_ep.qpn, local_ep.lid, 0);
            write_record(&mut stream, &channel_rec)?;
            let peer_channel = read_record(&mut stream, RecordType::ChannelInfo)?;
            let (remote_qpn, remote_lid) = match peer_channel.body {
                ConnectBody::Channel { qp_num, dlid, .. } => (qp_num, dlid),
                _ => unreachable!("read_record validated the type tag"),
            };

            let remote_ep = QpEndpoint {
                gid: peer_gid,
                lid: remote_lid,
                port_num: self.port.num(),
                qpn: remote_qpn,
            };
            engine.activate_endpoint(local_idx, remote_ep)?;
            engine.register_route(dest_ip, local_idx);
            host.add_endpoint();
        }

        write_record(&mut stream, &ConnectInfo::gogo())?;
        read_record(&mut stream, RecordType::GoGo)?;
        host.initialized = true;

        info!("handshake with {addr} complete, {n} QPs activated");
        self.hosts.lock().unwrap().push(host);
        Ok(())
    }

    fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream, HandshakeError> {
        for attempt in 0..MAX_CONN_RETRY {
            match TcpStream::connect(addr) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!("connect attempt {attempt} to {addr} failed: {e}");
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
        Err(HandshakeError::RetriesExhausted(MAX_CONN_RETRY))
    }

    /// Spawn a detached thread accepting `expected_hosts` peer connections
    /// and running the server side of the handshake for each. Returns
    /// immediately; `running` stops the accept loop when cleared.
    pub fn listen(
        self: &Arc<Self>,
        addr: SocketAddr,
        running: Arc<AtomicBool>,
    ) -> Result<thread::JoinHandle<()>, FabricError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let ctx = Arc::clone(self);

        Ok(thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        thread::spawn(move || {
                            if let Err(e) = ctx.accept_one(stream) {
                                error!("handshake with {peer} failed: {e}");
                            }
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(20));
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                        break;
                    }
                }
            }
        }))
    }

    fn accept_one(&self, mut stream: TcpStream) -> Result<(), FabricError> {
        stream.set_nodelay(true).ok();

        let client_host = read_record(&mut stream, RecordType::HostInfo)?;
        let (peer_gid, peer_qp_count) = match client_host.body {
            ConnectBody::Host { gid, number_of_qp } => (gid, number_of_qp),
            _ => unreachable!("read_record validated the type tag"),
        };

        let local_gid = self.local_gid();
        write_record(&mut stream, &ConnectInfo::host(local_gid, peer_qp_count))?;

        let mut host = Host::new(peer_gid);
        let dest_ip = ip_from_gid(&peer_gid);

        for i in 0..peer_qp_count {
            let engine_idx = (i as usize) % self.engines.len();
            let engine = &self.engines[engine_idx];

            let peer_channel = read_record(&mut stream, RecordType::ChannelInfo)?;
            let (remote_qpn, remote_lid) = match peer_channel.body {
                ConnectBody::Channel { qp_num, dlid, .. } => (qp_num, dlid),
                _ => unreachable!("read_record validated the type tag"),
            };

            let (local_idx, local_ep) = engine.create_endpoint(&self.port)?;
            write_record(&mut stream, &ConnectInfo::channel(local_ep.qpn, local_ep.lid, 0))?;

            let remote_ep = QpEndpoint {
                gid: peer_gid,
                lid: remote_lid,
                port_num: self.port.num(),
                qpn: remote_qpn,
            };
            engine.activate_endpoint(local_idx, remote_ep)?;
            engine.register_route(dest_ip, local_idx);
            host.add_endpoint();
        }

        read_record(&mut stream, RecordType::GoGo)?;
        write_record(&mut stream, &ConnectInfo::gogo())?;
        host.initialized = true;

        info!("accepted peer, {peer_qp_count} QPs activated");
        self.hosts.lock().unwrap().push(host);
        Ok(())
    }

    /// Number of peers that have completed the handshake.
    pub fn host_count(&self) -> usize {
        self.hosts.lock().unwrap().len()
    }
}

/// Derive an IPv4 address from the last four bytes of a GID, the way an
/// IPv4-mapped RoCE GID encodes it.
fn ip_from_gid(gid: &Gid) -> Ipv4Addr {
    let raw: [u8; 16] = (*gid).into();
    Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15])
}

fn write_record(stream: &mut TcpStream, rec: &ConnectInfo) -> Result<(), HandshakeError> {
    stream.write_all(&rec.encode())?;
    Ok(())
}

fn read_record(stream: &mut TcpStream, expected: RecordType) -> Result<ConnectInfo, HandshakeError> {
    let mut buf = [0u8; ConnectInfo::SIZE];
    let mut read = 0;
    while read < buf.len() {
        let n = stream.read(&mut buf[read..])?;
        if n == 0 {
            return Err(HandshakeError::ShortRead {
                expected: buf.len(),
                got: read,
            });
        }
        read += n;
    }
    ConnectInfo::decode(&buf, expected)
}
