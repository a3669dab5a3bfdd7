//! Client and server façades over a [`FabricContext`].

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::info;

use super::config::Config;
use super::context::FabricContext;
use super::engine::{IoEngine, ReplyCallback, RequestHandler, Role};
use super::error::FabricError;

/// A thin handle to one engine, exposing only the call it's meant to issue.
pub struct EngineHandle {
    engine: Arc<IoEngine>,
}

impl EngineHandle {
    /// Issue one request. `callback` fires on this engine's worker thread,
    /// synchronously with completion draining, once a reply for `ctx`
    /// arrives — it must not block.
    pub fn send(&self, dest: Ipv4Addr, ctx: u64, payload: Vec<u8>, callback: ReplyCallback) {
        self.engine.submit(dest, ctx, payload, callback);
    }

    /// Buffers outstanding on this engine's send region, for tests.
    pub fn remaining_send_buffers(&self) -> usize {
        self.engine.remaining_send_buffers()
    }
}

/// Owns a [`FabricContext`] configured as a client: connects out to a set of
/// peers and spawns one worker thread per engine running the client data
/// path.
pub struct ClientSession {
    ctx: Arc<FabricContext>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ClientSession {
    /// Build the underlying context. Call [`Self::connect`] for each peer,
    /// then [`Self::start`].
    pub fn init(cfg: Config) -> Result<Self, FabricError> {
        let ctx = FabricContext::new(cfg, || Role::Client)?;
        Ok(Self {
            ctx: Arc::new(ctx),
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        })
    }

    /// Run the handshake against one peer, blocking until `number_of_qp` QPs
    /// are activated or the connect retry budget is exhausted.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), FabricError> {
        self.ctx.connect(addr)
    }

    /// Spawn one worker thread per engine, each alternating dispatch and
    /// completion draining.
    pub fn start(&mut self) {
        self.running.store(true, Ordering::Relaxed);
        for engine in self.ctx.engines() {
            let engine = Arc::clone(engine);
            let running = Arc::clone(&self.running);
            self.workers.push(thread::spawn(move || engine.run(&running)));
        }
        info!("client session started with {} workers", self.workers.len());
    }

    /// A handle to engine `i`, to submit calls from.
    pub fn get_engine(&self, i: usize) -> EngineHandle {
        EngineHandle {
            engine: Arc::clone(&self.ctx.engines()[i]),
        }
    }

    /// Number of engines in this session.
    pub fn engine_count(&self) -> usize {
        self.ctx.engines().len()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }
    }
}

/// Owns a [`FabricContext`] configured as a server: listens for peers and
/// spawns one worker thread per engine running the server data path.
pub struct ServerSession {
    ctx: Arc<FabricContext>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServerSession {
    /// Build the underlying context with `handler` answering every request
    /// across every engine.
    pub fn init(cfg: Config, handler: RequestHandler) -> Result<Self, FabricError> {
        let ctx = FabricContext::new(cfg, || Role::Server {
            handler: Arc::clone(&handler),
        })?;
        Ok(Self {
            ctx: Arc::new(ctx),
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            accept_thread: None,
        })
    }

    /// Start listening on `addr` and spawn one worker per engine. The accept
    /// loop runs in its own detached thread until the session is dropped.
    pub fn start(&mut self, addr: SocketAddr) -> Result<(), FabricError> {
        self.running.store(true, Ordering::Relaxed);
        self.accept_thread = Some(self.ctx.listen(addr, Arc::clone(&self.running))?);

        for engine in self.ctx.engines() {
            let engine = Arc::clone(engine);
            let running = Arc::clone(&self.running);
            self.workers.push(thread::spawn(move || engine.run(&running)));
        }
        info!("server session listening on {addr} with {} workers", self.workers.len());
        Ok(())
    }

    /// Number of peers that have completed the handshake so far.
    pub fn host_count(&self) -> usize {
        self.ctx.host_count()
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.accept_thread.take() {
            t.join().ok();
        }
        for worker in self.workers.drain(..) {
            worker.join().ok();
        }
    }
}
