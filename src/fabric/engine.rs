//! One worker's share of the fabric: its own completion queues, buffer
//! regions, endpoints, and task queue.
//!
//! Each `IoEngine` is driven by exactly one worker thread (see
//! [`crate::fabric::session`]). After setup, an endpoint is touched only by
//! the `IoEngine` that created it — `Endpoint`'s data-plane methods take
//! `&self`, so this is purely a usage discipline rather than something the
//! borrow checker enforces; [`Endpoint::restore_from_err`] is the one
//! exception that needs `&mut`, which is why endpoints are kept behind an
//! uncontended per-entry `Mutex` rather than bare.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::{error, info, trace, warn};
use quanta::Clock;

use crate::rdma::cq::Cq;
use crate::rdma::mr::Permission;
use crate::rdma::nic::Port;
use crate::rdma::pd::Pd;
use crate::rdma::qp::QpEndpoint;

use super::config::Config;
use super::endpoint::Endpoint;
use super::error::FabricError;
use super::region::{Buffer, Region};
use super::wire::{PacketHeader, HEADER_SIZE};

/// Callback invoked on the client side once a reply is received.
/// Arguments are `(ctx, payload)`.
pub type ReplyCallback = Box<dyn FnOnce(u64, &[u8]) + Send>;

/// Server-side handler that turns an incoming `(ctx, payload)` into reply
/// bytes. Shared across all engines of a server session.
pub type RequestHandler = Arc<dyn Fn(u64, &[u8]) -> Vec<u8> + Send + Sync>;

/// Which half of a call this engine plays.
pub enum Role {
    /// Issues calls: dispatches queued tasks, matches replies back to
    /// callbacks via the registry.
    Client,
    /// Answers calls: on each recv completion, runs `handler` and sends the
    /// result back with the same `callback_tag`/`ctx`.
    Server { handler: RequestHandler },
}

/// One pending client call, waiting for a send buffer.
struct Task {
    dest: Ipv4Addr,
    ctx: u64,
    payload: Vec<u8>,
    callback_tag: u64,
}

/// This engine's share of the endpoints toward one destination, plus a
/// round-robin cursor over them.
struct Route {
    handles: Vec<usize>,
    cursor: AtomicUsize,
}

impl Route {
    /// Round-robin over `handles`. `None` if empty.
    ///
    /// Called `N` times in a row, the `K` distinct handles are each returned
    /// `⌈N/K⌉` or `⌊N/K⌋` times.
    fn pick(&self) -> Option<usize> {
        if self.handles.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        Some(self.handles[i])
    }
}

/// One engine: its own CQs, buffer regions, endpoints, and task queue.
pub struct IoEngine {
    pd: Pd,
    cfg: Config,
    role: Role,

    cqs: Vec<Cq>,
    next_cq: AtomicUsize,

    send_region: Region,
    recv_region: Region,

    endpoints: Vec<Mutex<Endpoint>>,
    routes: Mutex<HashMap<Ipv4Addr, Route>>,
    qpn_to_idx: Mutex<HashMap<u32, usize>>,

    tasks: ArrayQueue<Task>,
    callbacks: Mutex<HashMap<u64, ReplyCallback>>,
    next_tag: AtomicU64,

    bytes_sent: AtomicU64,
    bytes_recvd: AtomicU64,
}

impl IoEngine {
    /// Create an engine with `cq_num` completion queues and send/recv
    /// regions sized from `cfg`.
    pub fn new(pd: &Pd, cfg: Config, role: Role) -> Result<Self, FabricError> {
        let cqs = (0..cfg.cq_num)
            .map(|_| Cq::new(pd.context(), cfg.cq_depth))
            .collect::<Result<Vec<_>, _>>()?;

        let send_region = Region::new(
            pd,
            cfg.buf_num,
            cfg.sbuf_size,
            cfg.memalign,
            Permission::default(),
        )?;
        let recv_region = Region::new(
            pd,
            cfg.buf_num,
            cfg.rbuf_size,
            cfg.memalign,
            Permission::default(),
        )?;

        Ok(Self {
            pd: pd.clone(),
            cfg,
            role,
            cqs,
            next_cq: AtomicUsize::new(0),
            send_region,
            recv_region,
            endpoints: Vec::new(),
            routes: Mutex::new(HashMap::new()),
            qpn_to_idx: Mutex::new(HashMap::new()),
            tasks: ArrayQueue::new(4096),
            callbacks: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            bytes_sent: AtomicU64::new(0),
            bytes_recvd: AtomicU64::new(0),
        })
    }

    /// Number of buffers remaining in the send region (for tests: a fully
    /// drained engine must report `buf_num` once all in-flight sends land).
    pub fn remaining_send_buffers(&self) -> usize {
        self.send_region.remaining()
    }

    /// Create a fresh, un-activated endpoint bound to `port`, round-robining
    /// over this engine's CQ pool. Returns the endpoint's index and the
    /// descriptor to hand to the peer in the channel exchange.
    pub fn create_endpoint(&mut self, port: &Port) -> Result<(usize, QpEndpoint), FabricError> {
        let cq_idx = self.next_cq.fetch_add(1, Ordering::Relaxed) % self.cqs.len();
        let endpoint = Endpoint::new(&self.pd, port, &self.cfg, &self.cqs[cq_idx])?;
        let local = endpoint.local_descriptor().ok_or_else(|| {
            FabricError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "endpoint has no local descriptor after binding to port",
            ))
        })?;
        let idx = self.endpoints.len();
        self.qpn_to_idx.lock().unwrap().insert(local.qpn, idx);
        self.endpoints.push(Mutex::new(endpoint));
        Ok((idx, local))
    }

    /// Activate a previously created endpoint against the peer's descriptor,
    /// pre-posting `recv_batch` recvs from this engine's recv region.
    pub fn activate_endpoint(&self, idx: usize, remote: QpEndpoint) -> Result<(), FabricError> {
        let mut endpoint = self.endpoints[idx].lock().unwrap();
        endpoint.activate(remote, &self.recv_region, self.cfg.recv_batch)
    }

    /// Register an activated endpoint as usable for dispatch toward `dest`.
    pub fn register_route(&self, dest: Ipv4Addr, idx: usize) {
        let mut routes = self.routes.lock().unwrap();
        routes
            .entry(dest)
            .or_insert_with(|| Route {
                handles: Vec::new(),
                cursor: AtomicUsize::new(0),
            })
            .handles
            .push(idx);
    }

    /// Round-robin over this engine's endpoints toward `dest`.
    fn pick_endpoint(&self, dest: Ipv4Addr) -> Option<usize> {
        let routes = self.routes.lock().unwrap();
        routes.get(&dest)?.pick()
    }

    /// Enqueue a client call. `dest` must already have at least one
    /// registered route, or the task will be dropped once dispatched (see
    /// [`Self::dispatch_one`]).
    pub fn submit(&self, dest: Ipv4Addr, ctx: u64, payload: Vec<u8>, callback: ReplyCallback) {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().unwrap().insert(tag, callback);
        let task = Task {
            dest,
            ctx,
            payload,
            callback_tag: tag,
        };
        if self.tasks.push(task).is_err() {
            warn!("task queue full, dropping call to {dest}");
            self.callbacks.lock().unwrap().remove(&tag);
        }
    }

    /// One iteration of the engine's loop: dispatch one queued task (client
    /// only), then drain whatever completions are ready.
    pub fn tick(&self) {
        if matches!(self.role, Role::Client) {
            self.dispatch_one();
        }
        self.drain_completions();
    }

    /// Run [`Self::tick`] until `running` is cleared. Never sleeps on an
    /// empty iteration, per the engine's no-idle-wait loop; only explicit
    /// back-pressure paths (buffer exhaustion, failed posts) sleep.
    ///
    /// When `cfg.print_thp` is set, logs a throughput line roughly once a
    /// second.
    pub fn run(&self, running: &std::sync::atomic::AtomicBool) {
        let clock = Clock::new();
        let mut last_report = clock.now();
        let mut last_sent = 0u64;
        let mut last_recvd = 0u64;

        while running.load(Ordering::Relaxed) {
            self.tick();

            if self.cfg.print_thp {
                let now = clock.now();
                if now.duration_since(last_report) >= Duration::from_secs(1) {
                    let sent = self.bytes_sent.load(Ordering::Relaxed);
                    let recvd = self.bytes_recvd.load(Ordering::Relaxed);
                    info!(
                        "throughput: tx {:.2} MiB/s, rx {:.2} MiB/s",
                        (sent - last_sent) as f64 / (1024.0 * 1024.0),
                        (recvd - last_recvd) as f64 / (1024.0 * 1024.0),
                    );
                    last_sent = sent;
                    last_recvd = recvd;
                    last_report = now;
                }
            }
        }
    }

    fn dispatch_one(&self) {
        let Some(task) = self.tasks.pop() else {
            return;
        };

        let Some(buf) = self.send_region.acquire() else {
            // Back-pressure: no send buffer free. Not an error; retry later.
            let _ = self.tasks.push(task);
            return;
        };

        let Some(idx) = self.pick_endpoint(task.dest) else {
            error!("no endpoint toward {}, dropping call", task.dest);
            self.send_region.release(buf);
            self.callbacks.lock().unwrap().remove(&task.callback_tag);
            return;
        };

        // SAFETY: `buf` was just acquired from the send region's free-list
        // and is not concurrently accessed anywhere else.
        let mem = unsafe { buf.as_mut_slice() };
        let len = super::wire::frame(mem, task.callback_tag, task.ctx, &task.payload);

        let slice = self.send_region.slice_of(&buf);
        let endpoint = self.endpoints[idx].lock().unwrap();
        match endpoint.post_send(std::slice::from_ref(&slice), buf.address) {
            Ok(()) => {
                self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
            }
            Err(e) => {
                drop(endpoint);
                trace!("post_send failed: {e}, re-enqueuing task");
                self.send_region.release(buf);
                self.tasks
                    .push(Task {
                        dest: task.dest,
                        ctx: task.ctx,
                        payload: task.payload,
                        callback_tag: task.callback_tag,
                    })
                    .ok();
            }
        }
    }

    fn drain_completions(&self) {
        for cq in &self.cqs {
            let Ok(wcs) = cq.poll() else { continue };
            for wc in wcs {
                let addr = wc.wr_id();
                match wc.status() {
                    crate::rdma::cq::WcStatus::Success => {}
                    status => {
                        error!("completion error: {status:?}");
                        continue;
                    }
                }
                match wc.opcode() {
                    crate::rdma::cq::WcOpcode::Send => {
                        let buf = Buffer {
                            address: addr,
                            length: self.send_region.buf_size(),
                            local_key: self.send_region.lkey(),
                        };
                        self.send_region.release(buf);
                    }
                    crate::rdma::cq::WcOpcode::Recv => {
                        let Some(&idx) = self.qpn_to_idx.lock().unwrap().get(&wc.qp_num()) else {
                            error!("recv completion on unknown qp_num {}", wc.qp_num());
                            continue;
                        };
                        self.handle_recv(idx, addr);
                    }
                    _ => {}
                }
            }
        }
    }

    fn handle_recv(&self, idx: usize, addr: u64) {
        let buf = Buffer {
            address: addr,
            length: self.recv_region.buf_size(),
            local_key: self.recv_region.lkey(),
        };
        // SAFETY: the NIC has completed writing this buffer and no other
        // reference to it exists until we re-post it below.
        let mem = unsafe { buf.as_mut_slice() };
        let hdr = PacketHeader::decode(mem);
        let payload_len = (hdr.length as usize).min(mem.len() - HEADER_SIZE);
        let payload = &mem[HEADER_SIZE..HEADER_SIZE + payload_len];
        self.bytes_recvd
            .fetch_add(payload_len as u64, Ordering::Relaxed);

        match &self.role {
            Role::Client => {
                if let Some(cb) = self.callbacks.lock().unwrap().remove(&hdr.callback_tag) {
                    cb(hdr.context, payload);
                }
                self.repost_recv(idx, addr);
            }
            Role::Server { handler } => {
                let reply = handler(hdr.context, payload);
                self.repost_recv(idx, addr);
                self.send_reply(idx, hdr.callback_tag, hdr.context, &reply);
            }
        }
    }

    /// Re-post a single recv buffer on the endpoint `addr`'s completion
    /// actually arrived on, identified by `idx` (looked up from the
    /// completion's `qp_num` in [`Self::drain_completions`]).
    fn repost_recv(&self, idx: usize, addr: u64) {
        let buf = Buffer {
            address: addr,
            length: self.recv_region.buf_size(),
            local_key: self.recv_region.lkey(),
        };
        let slice = self.recv_region.slice_of(&buf);
        let endpoint = self.endpoints[idx].lock().unwrap();
        if let Err(e) = endpoint.post_recv(std::slice::from_ref(&slice), addr) {
            error!("post_recv failed on endpoint {idx}: {e}, buffer {addr:#x} lost");
        }
    }

    /// Frame and send a server reply over the endpoint the originating
    /// request arrived on, busy-waiting (50 us) on buffer exhaustion or
    /// post failure, per the server reply path's back-pressure policy.
    fn send_reply(&self, idx: usize, callback_tag: u64, ctx: u64, reply: &[u8]) {
        let buf = loop {
            if let Some(buf) = self.send_region.acquire() {
                break buf;
            }
            sleep(Duration::from_micros(50));
        };

        // SAFETY: exclusively owned until posted.
        let mem = unsafe { buf.as_mut_slice() };
        super::wire::frame(mem, callback_tag, ctx, reply);

        let slice = self.send_region.slice_of(&buf);
        loop {
            let endpoint = self.endpoints[idx].lock().unwrap();
            if endpoint.post_send(std::slice::from_ref(&slice), buf.address).is_ok() {
                break;
            }
            drop(endpoint);
            sleep(Duration::from_micros(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_pick_is_empty_safe() {
        let route = Route {
            handles: Vec::new(),
            cursor: AtomicUsize::new(0),
        };
        assert!(route.pick().is_none());
    }

    #[test]
    fn route_pick_round_robins_fairly() {
        let route = Route {
            handles: vec![10, 11, 12],
            cursor: AtomicUsize::new(0),
        };

        let mut counts = [0usize; 3];
        const N: usize = 11;
        for _ in 0..N {
            let handle = route.pick().unwrap();
            let slot = route.handles.iter().position(|h| *h == handle).unwrap();
            counts[slot] += 1;
        }

        let total: usize = counts.iter().sum();
        assert_eq!(total, N);
        for count in counts {
            assert!(count == N / 3 || count == N / 3 + 1);
        }
    }

    #[test]
    fn route_pick_is_sequential_not_random() {
        let route = Route {
            handles: vec![3, 7],
            cursor: AtomicUsize::new(0),
        };
        let picks: Vec<usize> = (0..4).map(|_| route.pick().unwrap()).collect();
        assert_eq!(picks, vec![3, 7, 3, 7]);
    }
}
