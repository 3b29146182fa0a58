//! Inbound half of the endpoint: the receive buffers kept posted to the
//! transport, arrival handling and delivery into posted receives.
use tracing::{debug, trace, warn};

use rxm_api::net::{CompletionEntry, CompletionFlags, CompletionStatus, OpFlags};
use rxm_api::{Error, MemDesc};

use crate::error::DatapathError;
use crate::msg_id::MsgId;
use crate::packet::{self, CtrlType, Frame, HdrFlags, OpCode, PktHdr};
use crate::recv_queue::{Arrival, Posted, QueueKind, RecvEntry, RecvQueue, UnexpMsg};
use crate::slab::{ChunkId, SlabPool};
use crate::transport::{
    CompletionSink, ConnHandle, ConnectionResolver, MemoryRegion, MsgTransport, OpContext,
    RawBuf, RemoteIov, WcStatus, WorkCompletion,
};

/// Collaborators the receive path calls out to.
pub struct RxCtx<'a> {
    pub transport: &'a dyn MsgTransport,
    pub cq: &'a dyn CompletionSink,
    pub resolver: &'a dyn ConnectionResolver,
}

/// Follow-up work for the send half, run after the receive lock is dropped.
#[derive(Debug, PartialEq, Eq)]
pub enum RxOutcome {
    Done,
    /// A peer acknowledged one of our rendezvous sends.
    AckArrived(MsgId),
    /// We fetched a peer's rendezvous data and owe it an ack.
    SendAck(ConnHandle, MsgId),
}

/// A rendezvous receive waiting for its reads.
struct PendingRead {
    kind: QueueKind,
    entry: u32,
    msg_id: MsgId,
    pending: usize,
    len: usize,
    overflow: usize,
    error: Option<u32>,
    mrs: Vec<Box<dyn MemoryRegion>>,
}

#[derive(Default)]
struct RxBuf {
    len: usize,
    conn: Option<ConnHandle>,
    read: Option<PendingRead>,
}

pub struct RxState {
    pool: SlabPool,
    bufs: Vec<RxBuf>,
    msg: RecvQueue,
    tagged: RecvQueue,
    /// Buffers the transport refused, retried on the next completion.
    stalled: Vec<ChunkId>,
    closing: bool,
}

fn comp_flags(kind: QueueKind, hdr: &PktHdr) -> CompletionFlags {
    let mut flags = CompletionFlags::RECV;
    flags |= match kind {
        QueueKind::Msg => CompletionFlags::MSG,
        QueueKind::Tagged => CompletionFlags::TAGGED,
    };
    if hdr.flags().contains(HdrFlags::REMOTE_CQ_DATA) {
        flags |= CompletionFlags::REMOTE_CQ_DATA;
    }
    flags
}

fn write_completion(
    cq: &dyn CompletionSink,
    kind: QueueKind,
    entry: &RecvEntry,
    hdr: &PktHdr,
    len: usize,
    status: CompletionStatus,
) {
    if status == CompletionStatus::Success && !entry.flags.contains(OpFlags::COMPLETION) {
        return;
    }
    let flags = comp_flags(kind, hdr);
    let comp = CompletionEntry {
        context: entry.context,
        flags,
        len,
        data: if flags.contains(CompletionFlags::REMOTE_CQ_DATA) {
            hdr.op.data
        } else {
            0
        },
        tag: if kind == QueueKind::Tagged {
            hdr.op.tag
        } else {
            0
        },
        status,
    };
    if let Err(e) = cq.write(comp) {
        warn!(?e, context = ?entry.context, "failed to write receive completion");
    }
}

fn status_of(error: Option<u32>, overflow: usize) -> CompletionStatus {
    match error {
        Some(code) => CompletionStatus::Error(code),
        None if overflow > 0 => CompletionStatus::Truncated { overflow },
        None => CompletionStatus::Success,
    }
}

/// Splits the transfer of `remote` into `local` into pieces that are
/// contiguous on both sides. Remote bytes that do not fit are left out.
fn plan_reads(
    local: &[(RawBuf, Option<MemDesc>)],
    remote: &[RemoteIov],
) -> Vec<(RawBuf, Option<MemDesc>, RemoteIov)> {
    let mut pieces = Vec::new();
    let (mut li, mut loff) = (0, 0);
    for r in remote {
        let mut roff = 0u64;
        while roff < r.len && li < local.len() {
            let (lbuf, ldesc) = local[li];
            let n = (r.len - roff).min((lbuf.len - loff) as u64) as usize;
            if n == 0 {
                li += 1;
                loff = 0;
                continue;
            }
            pieces.push((
                RawBuf {
                    // SAFETY: `loff + n <= lbuf.len`.
                    ptr: unsafe { lbuf.ptr.add(loff) },
                    len: n,
                },
                ldesc,
                RemoteIov {
                    addr: r.addr + roff,
                    len: n as u64,
                    key: r.key,
                },
            ));
            roff += n as u64;
            loff += n;
            if loff == lbuf.len {
                li += 1;
                loff = 0;
            }
        }
    }
    pieces
}

impl RxState {
    pub fn new(pool: SlabPool, queue_size: usize) -> Self {
        let mut bufs = Vec::with_capacity(pool.capacity());
        bufs.resize_with(pool.capacity(), RxBuf::default);
        RxState {
            pool,
            bufs,
            msg: RecvQueue::new(QueueKind::Msg, queue_size),
            tagged: RecvQueue::new(QueueKind::Tagged, queue_size),
            stalled: Vec::new(),
            closing: false,
        }
    }

    #[inline]
    pub fn queue(&self, kind: QueueKind) -> &RecvQueue {
        match kind {
            QueueKind::Msg => &self.msg,
            QueueKind::Tagged => &self.tagged,
        }
    }

    #[inline]
    pub fn stalled(&self) -> usize {
        self.stalled.len()
    }

    /// Hands every receive buffer to the transport. If the very first post is
    /// refused nothing stays posted and the error is returned; later refusals
    /// leave the buffer stalled for a retry.
    pub fn post_all(&mut self, transport: &dyn MsgTransport) -> Result<usize, Error> {
        let mut posted = 0;
        while let Ok(chunk) = self.pool.acquire() {
            match self.post_buf(transport, chunk) {
                Ok(()) => posted += 1,
                Err(e) if posted == 0 => {
                    self.pool.release(chunk);
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(%e, chunk = chunk.0, "receive buffer stalled");
                    self.stalled.push(chunk);
                }
            }
        }
        debug!(posted, stalled = self.stalled.len(), "receive buffers posted");
        Ok(posted)
    }

    fn post_buf(
        &mut self,
        transport: &dyn MsgTransport,
        chunk: ChunkId,
    ) -> Result<(), DatapathError> {
        let raw = self.pool.raw_chunk(chunk, self.pool.chunk_size());
        let wr_id = OpContext::Rx(chunk.0).to_wr_id();
        let buf = &mut self.bufs[chunk.0 as usize];
        buf.len = 0;
        buf.conn = None;
        // SAFETY: the chunk stays acquired and untouched until the completion
        // for `wr_id` is handled.
        unsafe { transport.post_recv(raw, self.pool.desc(), wr_id) }
            .map_err(DatapathError::PostRecv)
    }

    fn repost(&mut self, transport: &dyn MsgTransport, chunk: ChunkId) {
        if self.closing {
            return;
        }
        if let Err(e) = self.post_buf(transport, chunk) {
            warn!(%e, chunk = chunk.0, "failed to repost receive buffer");
            self.stalled.push(chunk);
        }
    }

    pub fn retry_stalled(&mut self, transport: &dyn MsgTransport) {
        let stalled = std::mem::take(&mut self.stalled);
        for chunk in stalled {
            self.repost(transport, chunk);
        }
    }

    /// Posts a receive, delivering at once if a matching message already
    /// arrived.
    pub fn post_recv(
        &mut self,
        ctx: &RxCtx<'_>,
        kind: QueueKind,
        entry: RecvEntry,
    ) -> Result<RxOutcome, Error> {
        // close may have drained the queues after the caller's enabled check
        if self.closing {
            return Err(Error::NotEnabled);
        }
        let can_complete = !ctx.cq.is_full();
        let queue = match kind {
            QueueKind::Msg => &mut self.msg,
            QueueKind::Tagged => &mut self.tagged,
        };
        match queue.post(entry, can_complete)? {
            Posted::Matched(index, msg) => Ok(self.deliver(ctx, kind, index, msg.buf)),
            Posted::Queued(index) => {
                trace!(?kind, index, "receive queued");
                Ok(RxOutcome::Done)
            }
        }
    }

    /// Completion of a receive buffer.
    pub fn recv_done(
        &mut self,
        ctx: &RxCtx<'_>,
        chunk: u32,
        wc: &WorkCompletion,
    ) -> Result<RxOutcome, Error> {
        let chunk = ChunkId(chunk);
        if !self.pool.is_acquired(chunk) {
            return Err(Error::InvalidArgument(format!(
                "receive buffer {} not posted",
                chunk.0
            )));
        }
        if let WcStatus::Error(code) = wc.status {
            warn!(chunk = chunk.0, code, "receive failed");
            self.repost(ctx.transport, chunk);
            return Ok(RxOutcome::Done);
        }

        let len = (wc.byte_len as usize).min(self.pool.chunk_size());
        let hdr = match packet::parse(&self.pool.chunk(chunk)[..len]) {
            Ok((hdr, _)) => hdr,
            Err(e) => {
                warn!(%e, chunk = chunk.0, "dropping malformed frame");
                self.repost(ctx.transport, chunk);
                return Err(e.into());
            }
        };

        if hdr.ctrl_type()? == CtrlType::Ack {
            self.repost(ctx.transport, chunk);
            return Ok(RxOutcome::AckArrived(MsgId(hdr.ctrl.msg_id)));
        }

        let (addr, conn) = match ctx.resolver.lookup(hdr.ctrl.conn_id) {
            Some(found) => found,
            None => {
                warn!(conn_id = hdr.ctrl.conn_id, "frame from unknown connection");
                self.repost(ctx.transport, chunk);
                return Err(Error::InvalidArgument(format!(
                    "unknown connection {}",
                    hdr.ctrl.conn_id
                )));
            }
        };
        let buf = &mut self.bufs[chunk.0 as usize];
        buf.len = len;
        buf.conn = Some(conn);

        let (kind, tag) = match hdr.op_code()? {
            OpCode::Msg => (QueueKind::Msg, 0),
            OpCode::Tagged => (QueueKind::Tagged, hdr.op.tag),
        };
        let queue = match kind {
            QueueKind::Msg => &mut self.msg,
            QueueKind::Tagged => &mut self.tagged,
        };
        match queue.arrival(UnexpMsg { addr, tag, buf: chunk }) {
            Arrival::Matched(index, _) => Ok(self.deliver(ctx, kind, index, chunk)),
            Arrival::Unexpected => Ok(RxOutcome::Done),
        }
    }

    /// Hands the message in `chunk` to the bound receive `index`.
    fn deliver(
        &mut self,
        ctx: &RxCtx<'_>,
        kind: QueueKind,
        index: u32,
        chunk: ChunkId,
    ) -> RxOutcome {
        let len = self.bufs[chunk.0 as usize].len;
        let queue = match kind {
            QueueKind::Msg => &mut self.msg,
            QueueKind::Tagged => &mut self.tagged,
        };
        let (hdr, frame) = match packet::parse(&self.pool.chunk(chunk)[..len]) {
            Ok(parsed) => parsed,
            Err(e) => {
                // validated on arrival
                warn!(%e, chunk = chunk.0, "frame changed after arrival");
                queue.release(index);
                self.repost(ctx.transport, chunk);
                return RxOutcome::Done;
            }
        };

        match frame {
            Frame::Eager(payload) => {
                let entry = queue.entry(index);
                let mut off = 0;
                for (iov, _) in &entry.iov {
                    let n = iov.len().min(payload.len() - off);
                    if n > 0 {
                        // SAFETY: the owner of the receive keeps its segments
                        // valid and unaliased until the completion.
                        let dst = unsafe { iov.as_mut_slice() };
                        dst[..n].copy_from_slice(&payload[off..off + n]);
                    }
                    off += n;
                }
                let status = status_of(None, payload.len() - off);
                trace!(?kind, index, len = off, "eager delivery");
                write_completion(ctx.cq, kind, entry, &hdr, off, status);
                queue.release(index);
                self.repost(ctx.transport, chunk);
                RxOutcome::Done
            }
            Frame::Rendezvous(remote) => {
                let entry = queue.entry(index);
                let mut read = PendingRead {
                    kind,
                    entry: index,
                    msg_id: MsgId(hdr.ctrl.msg_id),
                    pending: 0,
                    len: 0,
                    overflow: 0,
                    error: None,
                    mrs: Vec::new(),
                };

                let mut local = Vec::with_capacity(entry.iov.len());
                for &(iov, desc) in &entry.iov {
                    let raw = RawBuf {
                        ptr: iov.as_ptr(),
                        len: iov.len(),
                    };
                    let desc = match desc {
                        None if ctx.transport.requires_local_mr() && read.error.is_none() => {
                            // SAFETY: the receive's segments stay valid until
                            // its completion, and `mrs` is dropped before that.
                            match unsafe { ctx.transport.register(raw) } {
                                Ok(mr) => {
                                    let d = mr.desc();
                                    read.mrs.push(mr);
                                    Some(d)
                                }
                                Err(e) => {
                                    warn!(%e, "failed to register receive buffer");
                                    read.error =
                                        Some(e.raw_os_error().map_or(1024, |x| x as u32));
                                    None
                                }
                            }
                        }
                        d => d,
                    };
                    local.push((raw, desc));
                }

                let total: u64 = remote.iter().map(|r| r.len).sum();
                let conn = self.bufs[chunk.0 as usize].conn;
                if let (None, Some(conn)) = (read.error, conn) {
                    let wr_id = OpContext::Read(chunk.0).to_wr_id();
                    for (lbuf, ldesc, r) in plan_reads(&local, &remote) {
                        // SAFETY: see the registration above.
                        match unsafe { ctx.transport.post_read(&conn, lbuf, ldesc, r, wr_id) } {
                            Ok(()) => {
                                read.pending += 1;
                                read.len += lbuf.len;
                            }
                            Err(e) => {
                                let e = DatapathError::PostRead(e);
                                warn!(%e, "rendezvous read not issued");
                                read.error = Some(e.as_vendor_err());
                                break;
                            }
                        }
                    }
                }
                read.overflow = (total as usize).saturating_sub(read.len);
                trace!(?kind, index, reads = read.pending, total, "rendezvous delivery");

                let pending = read.pending;
                self.bufs[chunk.0 as usize].read = Some(read);
                if pending == 0 {
                    self.finish_read(ctx, chunk)
                } else {
                    RxOutcome::Done
                }
            }
            Frame::Ack => unreachable!("acks are never queued"),
        }
    }

    /// Completion of one rendezvous read into the receive served by `chunk`.
    pub fn read_done(
        &mut self,
        ctx: &RxCtx<'_>,
        chunk: u32,
        status: WcStatus,
    ) -> Result<RxOutcome, Error> {
        let chunk = ChunkId(chunk);
        let read = self
            .bufs
            .get_mut(chunk.0 as usize)
            .and_then(|b| b.read.as_mut())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no read pending on buffer {}", chunk.0))
            })?;
        if let WcStatus::Error(code) = status {
            warn!(chunk = chunk.0, code, "rendezvous read failed");
            if read.error.is_none() {
                read.error = Some(code);
            }
        }
        read.pending -= 1;
        if read.pending == 0 {
            Ok(self.finish_read(ctx, chunk))
        } else {
            Ok(RxOutcome::Done)
        }
    }

    fn finish_read(&mut self, ctx: &RxCtx<'_>, chunk: ChunkId) -> RxOutcome {
        let buf = &mut self.bufs[chunk.0 as usize];
        let read = match buf.read.take() {
            Some(r) => r,
            None => return RxOutcome::Done,
        };
        let conn = buf.conn;
        let hdr = match packet::parse(&self.pool.chunk(chunk)[..buf.len]) {
            Ok((hdr, _)) => hdr,
            Err(_) => PktHdr::default(),
        };
        let queue = match read.kind {
            QueueKind::Msg => &mut self.msg,
            QueueKind::Tagged => &mut self.tagged,
        };
        let status = status_of(read.error, read.overflow);
        write_completion(ctx.cq, read.kind, queue.entry(read.entry), &hdr, read.len, status);
        queue.release(read.entry);
        drop(read.mrs);
        self.repost(ctx.transport, chunk);
        match conn {
            Some(conn) => RxOutcome::SendAck(conn, read.msg_id),
            None => RxOutcome::Done,
        }
    }

    /// Frees every posted receive and unexpected message. No buffer is
    /// reposted afterwards.
    pub fn drain(&mut self) -> usize {
        self.closing = true;
        let mut dropped = self.msg.drain();
        dropped.extend(self.tagged.drain());
        for buf in self.bufs.iter_mut() {
            if let Some(read) = buf.read.take() {
                match read.kind {
                    QueueKind::Msg => self.msg.release(read.entry),
                    QueueKind::Tagged => self.tagged.release(read.entry),
                }
            }
        }
        self.stalled.clear();
        dropped.len()
    }
}
