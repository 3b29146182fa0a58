use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use tracing::{debug, info};

use rxm_api::net::{BindFlags, Caps, OpFlags};
use rxm_api::{Addr, Context, Error, Iov, MemDesc, Tag};

use crate::completion::{RxCtx, RxOutcome, RxState};
use crate::config::EndpointAttr;
use crate::fabric::Fabric;
use crate::packet::{MAX_RMA_LEN, PKT_HDR_LEN};
use crate::recv_queue::{QueueKind, RecvEntry};
use crate::send::{SendRequest, TxState};
use crate::slab::SlabPool;
use crate::transport::{
    CompletionSink, ConnectionResolver, MsgTransport, OpContext, WorkCompletion,
};

#[derive(Default)]
struct Bindings {
    tx_cq: Option<Arc<dyn CompletionSink>>,
    rx_cq: Option<Arc<dyn CompletionSink>>,
    av: Option<Arc<dyn ConnectionResolver>>,
    tx_op_flags: OpFlags,
    rx_op_flags: OpFlags,
}

/// The bindings of an enabled endpoint.
pub(crate) struct Active<'a> {
    pub tx_cq: &'a dyn CompletionSink,
    pub rx_cq: &'a dyn CompletionSink,
    pub av: &'a dyn ConnectionResolver,
    pub tx_op_flags: OpFlags,
    pub rx_op_flags: OpFlags,
}

/// A reliable, tag-matching endpoint emulated over a [`MsgTransport`].
///
/// Receive-side state and send-side state sit behind separate locks that are
/// never held together, so the application may post while another thread
/// drives [`Endpoint::handle_completion`].
pub struct Endpoint {
    fabric: Arc<Fabric>,
    attr: EndpointAttr,
    transport: Arc<dyn MsgTransport>,
    bindings: spin::RwLock<Bindings>,
    enabled: AtomicBool,
    closing: AtomicBool,
    rx: spin::Mutex<RxState>,
    tx: spin::Mutex<TxState>,
}

impl Endpoint {
    pub fn new(
        fabric: Arc<Fabric>,
        attr: EndpointAttr,
        transport: Arc<dyn MsgTransport>,
    ) -> Result<Self, Error> {
        attr.validate()?;
        let chunk_size = PKT_HDR_LEN + attr.eager_threshold.max(MAX_RMA_LEN);
        let reg = if transport.requires_local_mr() {
            Some(&*transport)
        } else {
            None
        };
        let tx_pool = SlabPool::new(attr.tx_size, chunk_size, reg)?;
        let rx_pool = SlabPool::new(attr.rx_size, chunk_size, reg)?;
        debug!(?attr, chunk_size, fabric = fabric.name(), "endpoint created");

        Ok(Endpoint {
            fabric,
            attr,
            transport,
            bindings: spin::RwLock::new(Bindings::default()),
            enabled: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            rx: spin::Mutex::new(RxState::new(rx_pool, attr.rx_size)),
            tx: spin::Mutex::new(TxState::new(tx_pool, attr.tx_size, attr.eager_threshold)),
        })
    }

    #[inline]
    pub fn attr(&self) -> &EndpointAttr {
        &self.attr
    }

    #[inline]
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    /// Attaches a completion sink for the roles in `flags`.
    ///
    /// Unless `SELECTIVE_COMPLETION` is given, every operation of those roles
    /// reports a completion.
    pub fn bind_cq(&self, cq: Arc<dyn CompletionSink>, flags: BindFlags) -> Result<(), Error> {
        if !BindFlags::all().contains(flags) {
            return Err(Error::InvalidArgument(format!(
                "invalid bind flags {:#x}",
                flags.bits()
            )));
        }
        let mut b = self.bindings.write();
        if flags.contains(BindFlags::TRANSMIT) && b.tx_cq.is_some() {
            return Err(Error::DuplicateBinding("transmit completion queue"));
        }
        if flags.contains(BindFlags::RECV) && b.rx_cq.is_some() {
            return Err(Error::DuplicateBinding("receive completion queue"));
        }
        let selective = flags.contains(BindFlags::SELECTIVE_COMPLETION);
        if flags.contains(BindFlags::TRANSMIT) {
            b.tx_cq = Some(Arc::clone(&cq));
            if !selective {
                b.tx_op_flags |= OpFlags::COMPLETION;
            }
        }
        if flags.contains(BindFlags::RECV) {
            b.rx_cq = Some(cq);
            if !selective {
                b.rx_op_flags |= OpFlags::COMPLETION;
            }
        }
        debug!(?flags, "completion queue bound");
        Ok(())
    }

    /// Attaches the address resolver.
    pub fn bind_av(&self, av: Arc<dyn ConnectionResolver>) -> Result<(), Error> {
        let mut b = self.bindings.write();
        if b.av.is_some() {
            return Err(Error::DuplicateBinding("address vector"));
        }
        b.av = Some(av);
        debug!("address vector bound");
        Ok(())
    }

    /// Starts traffic: every receive buffer is handed to the transport.
    ///
    /// Requires both completion roles and the address resolver to be bound,
    /// and does nothing otherwise.
    pub fn enable(&self) -> Result<(), Error> {
        let b = self.bindings.read();
        if b.tx_cq.is_none() {
            return Err(Error::MissingResource("transmit completion queue"));
        }
        if b.rx_cq.is_none() {
            return Err(Error::MissingResource("receive completion queue"));
        }
        if b.av.is_none() {
            return Err(Error::MissingResource("address vector"));
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(Error::NotEnabled);
        }
        let mut rx = self.rx.lock();
        if self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let posted = rx.post_all(&*self.transport)?;
        self.enabled.store(true, Ordering::Release);
        info!(posted, caps = ?self.attr.caps, "endpoint enabled");
        Ok(())
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.closing.load(Ordering::Acquire)
    }

    /// Fails with `Unsupported` unless the endpoint was opened with `caps`.
    #[inline]
    pub(crate) fn require(&self, caps: Caps) -> Result<(), Error> {
        if self.attr.caps.contains(caps) {
            Ok(())
        } else {
            Err(Error::Unsupported)
        }
    }

    fn with_active<R>(&self, f: impl FnOnce(Active<'_>) -> Result<R, Error>) -> Result<R, Error> {
        if !self.is_enabled() {
            return Err(Error::NotEnabled);
        }
        let b = self.bindings.read();
        match (&b.tx_cq, &b.rx_cq, &b.av) {
            (Some(tx_cq), Some(rx_cq), Some(av)) => f(Active {
                tx_cq: &**tx_cq,
                rx_cq: &**rx_cq,
                av: &**av,
                tx_op_flags: b.tx_op_flags,
                rx_op_flags: b.rx_op_flags,
            }),
            _ => Err(Error::NotEnabled),
        }
    }

    fn check_iov(&self, iov: &[Iov], desc: &[MemDesc]) -> Result<(), Error> {
        if iov.len() > self.attr.max_iov {
            return Err(Error::InvalidArgument(format!(
                "{} segments exceed the limit of {}",
                iov.len(),
                self.attr.max_iov
            )));
        }
        if !desc.is_empty() && desc.len() != iov.len() {
            return Err(Error::InvalidArgument(format!(
                "{} descriptors for {} segments",
                desc.len(),
                iov.len()
            )));
        }
        Ok(())
    }

    /// Posts a receive on the queue of `kind`.
    ///
    /// # Safety
    ///
    /// The memory behind `iov` must stay valid and must not be accessed until
    /// the receive completes or the endpoint is closed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn post_recv(
        &self,
        kind: QueueKind,
        iov: &[Iov],
        desc: &[MemDesc],
        src: Addr,
        tag: Tag,
        ignore: Tag,
        context: Context,
        flags: OpFlags,
    ) -> Result<(), Error> {
        self.check_iov(iov, desc)?;
        self.with_active(|a| {
            let mut segs = ArrayVec::new();
            for (i, &seg) in iov.iter().enumerate() {
                segs.push((seg, desc.get(i).copied()));
            }
            let entry = RecvEntry {
                iov: segs,
                addr: if self.attr.caps.contains(Caps::DIRECTED_RECV) {
                    src
                } else {
                    Addr::UNSPEC
                },
                tag,
                ignore,
                flags: flags | a.rx_op_flags,
                context,
            };
            let ctx = RxCtx {
                transport: &*self.transport,
                cq: a.rx_cq,
                resolver: a.av,
            };
            let out = self.rx.lock().post_recv(&ctx, kind, entry)?;
            self.follow_up(&a, out)
        })
    }

    /// Sends to `dest`.
    ///
    /// # Safety
    ///
    /// The memory behind `req.iov` must stay valid and unmodified until the
    /// send completes or the endpoint is closed.
    pub(crate) unsafe fn post_send(&self, dest: Addr, req: SendRequest<'_>) -> Result<(), Error> {
        self.check_iov(req.iov, req.desc)?;
        self.with_active(|a| {
            let conn = a.av.resolve(dest)?;
            let flags = if req.flags.contains(OpFlags::INJECT) {
                (req.flags | a.tx_op_flags) - OpFlags::COMPLETION
            } else {
                req.flags | a.tx_op_flags
            };
            let req = SendRequest { flags, ..req };
            self.tx.lock().send(&*self.transport, &conn, req)
        })
    }

    /// Runs the send-side work a receive-side event produced, then retries
    /// any acks still waiting for the transport. Called with the receive lock
    /// released.
    fn follow_up(&self, a: &Active<'_>, out: RxOutcome) -> Result<(), Error> {
        let mut tx = self.tx.lock();
        let res = match out {
            RxOutcome::Done => Ok(()),
            RxOutcome::AckArrived(id) => tx.ack_arrived(a.tx_cq, id),
            RxOutcome::SendAck(conn, id) => {
                tx.send_ack(&*self.transport, conn, id);
                Ok(())
            }
        };
        if tx.deferred_acks() > 0 {
            tx.flush_deferred_acks(&*self.transport);
        }
        res
    }

    /// Processes one completion reported by the transport. This is the only
    /// way messages arrive and operations complete.
    ///
    /// Malformed frames, stale acks and unknown work requests are reported as
    /// errors after the affected buffer has been recycled.
    pub fn handle_completion(&self, wc: WorkCompletion) -> Result<(), Error> {
        let op = OpContext::from_wr_id(wc.wr_id).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown work request {:#x}", wc.wr_id))
        })?;
        let transport = &*self.transport;
        self.with_active(|a| match op {
            OpContext::Tx(index) => self.tx.lock().tx_done(transport, a.tx_cq, index, wc.status),
            OpContext::Ack(chunk) => {
                self.tx.lock().ack_done(transport, chunk, wc.status);
                Ok(())
            }
            OpContext::Rx(chunk) => {
                let ctx = RxCtx {
                    transport,
                    cq: a.rx_cq,
                    resolver: a.av,
                };
                let out = {
                    let mut rx = self.rx.lock();
                    rx.retry_stalled(transport);
                    rx.recv_done(&ctx, chunk, &wc)?
                };
                self.follow_up(&a, out)
            }
            OpContext::Read(chunk) => {
                let ctx = RxCtx {
                    transport,
                    cq: a.rx_cq,
                    resolver: a.av,
                };
                let out = self.rx.lock().read_done(&ctx, chunk, wc.status)?;
                self.follow_up(&a, out)
            }
        })
    }

    /// Forbids new operations and releases everything queued. Called on drop.
    ///
    /// The transport must not complete work posted by this endpoint
    /// afterwards.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.rx.lock().drain();
        let in_flight = self.tx.lock().drain();
        info!(dropped, in_flight, "endpoint closed");
    }

    /// Posted receives waiting on the queue of `kind`.
    pub fn posted_len(&self, kind: QueueKind) -> usize {
        self.rx.lock().queue(kind).posted_len()
    }

    /// Unexpected messages waiting on the queue of `kind`.
    pub fn unexpected_len(&self, kind: QueueKind) -> usize {
        self.rx.lock().queue(kind).unexpected_len()
    }

    /// Receive buffers the transport refused and that await a retry.
    pub fn stalled_buffers(&self) -> usize {
        self.rx.lock().stalled()
    }

    /// Sends not yet complete.
    pub fn tx_in_flight(&self) -> usize {
        self.tx.lock().in_flight()
    }

    /// Acks owed to peers that could not be posted yet.
    pub fn deferred_acks(&self) -> usize {
        self.tx.lock().deferred_acks()
    }

    /// Rendezvous sends holding a message id.
    pub fn rendezvous_in_flight(&self) -> usize {
        self.tx.lock().rendezvous_in_flight()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}
