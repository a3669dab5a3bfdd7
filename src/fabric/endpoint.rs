//! A single RDMA RC queue pair between this process and one remote peer.

use std::io;

use log::debug;

use crate::rdma::cq::Cq;
use crate::rdma::nic::Port;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpCaps, QpEndpoint, QpState, QpType};

use super::config::Config;
use super::error::FabricError;
use super::region::Region;

/// One activated RC connection to a remote peer.
///
/// Only the owning [`super::engine::IoEngine`]'s worker thread touches the
/// underlying QP after activation (`ibv_post_send`/`ibv_post_recv` require no
/// locking as a result); `Endpoint` itself holds no back-reference to the
/// engine or host that own it; callers pass those in by handle instead of
/// the queue pair closing over them.
pub struct Endpoint {
    qp: Qp,
    activated: bool,
}

impl Endpoint {
    /// Create a fresh RC queue pair on `pd`, bound to `port` and attached to
    /// one of the owning engine's completion queues, ready for a
    /// handshake's channel exchange.
    ///
    /// `cq` is chosen by the caller via round-robin over the engine's CQ
    /// pool (see [`super::engine::IoEngine`]) and serves both the send and
    /// recv queues, so draining an engine's completions only ever means
    /// polling its `cq_num` CQs, never each endpoint individually.
    pub fn new(pd: &Pd, port: &Port, cfg: &Config, cq: &Cq) -> Result<Self, FabricError> {
        let caps = QpCaps {
            max_send_wr: cfg.send_wq_depth,
            max_recv_wr: cfg.recv_wq_depth,
            ..QpCaps::default()
        };

        let mut qp = Qp::builder()
            .send_cq(cq)
            .recv_cq(cq)
            .caps(caps)
            .qp_type(QpType::Rc)
            .sq_sig_all(false)
            .global_routing(true)
            .build(pd)?;

        qp.bind_local_port(port, Some(cfg.gid))?;
        Ok(Self {
            qp,
            activated: false,
        })
    }

    /// This side's endpoint descriptor, to be sent to the peer during the
    /// channel exchange.
    pub fn local_descriptor(&self) -> Option<QpEndpoint> {
        self.qp.endpoint()
    }

    /// Bring the QP up to RTS against the peer's descriptor and pre-post
    /// `recv_batch` receive buffers from `recv_region`.
    ///
    /// On success, `self.activated()` becomes `true` and the underlying QP
    /// reports [`QpState::Rts`].
    pub fn activate(
        &mut self,
        remote: QpEndpoint,
        recv_region: &Region,
        recv_batch: usize,
    ) -> Result<(), FabricError> {
        self.qp.bind_peer(remote)?;

        for wr_id in 0..recv_batch {
            let buf = recv_region
                .acquire()
                .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "recv region exhausted"))?;
            let slice = recv_region.slice_of(&buf);
            if let Err(e) = self.qp.recv(std::slice::from_ref(&slice), wr_id as u64) {
                recv_region.release(buf);
                return Err(e.into());
            }
        }

        debug_assert_eq!(self.qp.state(), QpState::Rts);
        self.activated = true;
        debug!("endpoint activated, qpn={}", self.qp.endpoint().map(|e| e.qpn).unwrap_or(0));
        Ok(())
    }

    /// Whether [`Self::activate`] has completed successfully.
    #[inline]
    pub fn activated(&self) -> bool {
        self.activated
    }

    /// Current verbs-level state of the underlying QP.
    #[inline]
    pub fn state(&self) -> QpState {
        self.qp.state()
    }

    /// Post a send of `local` (one sge covering the framed packet buffer).
    pub fn post_send(&self, local: &[crate::rdma::mr::MrSlice], wr_id: u64) -> io::Result<()> {
        self.qp.send(local, None, None, wr_id, true, false)
    }

    /// Re-post a single recv buffer after its completion has been consumed.
    pub fn post_recv(&self, local: &[crate::rdma::mr::MrSlice], wr_id: u64) -> io::Result<()> {
        self.qp.recv(local, wr_id)
    }

    /// Send completion queue.
    pub fn scq(&self) -> &crate::rdma::cq::Cq {
        self.qp.scq()
    }

    /// Receive completion queue.
    pub fn rcq(&self) -> &crate::rdma::cq::Cq {
        self.qp.rcq()
    }

    /// Local QP number, the half of `(local_qpn, remote_qpn)` used to check
    /// handshake symmetry.
    pub fn local_qpn(&self) -> Option<u32> {
        self.qp.endpoint().map(|e| e.qpn)
    }

    /// Remote QP number, once activated.
    pub fn remote_qpn(&self) -> Option<u32> {
        self.qp.peer().map(|p| p.endpoint().qpn)
    }

    /// Drive the QP back to RESET after a fatal completion, so a fresh
    /// `activate` call can bring it back up.
    pub fn restore_from_err(&mut self) -> io::Result<()> {
        self.qp.reset()?;
        self.activated = false;
        Ok(())
    }
}
