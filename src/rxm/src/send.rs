//! Outbound half of the endpoint: send records, eager and rendezvous
//! framing, and acknowledgments.
use std::collections::VecDeque;

use arrayvec::ArrayVec;
use tracing::{debug, trace, warn};

use rxm_api::net::{CompletionEntry, CompletionFlags, CompletionStatus, OpFlags};
use rxm_api::{buf::iov_len, Context, Error, Iov, MemDesc, Tag, IOV_LIMIT};

use crate::error::DatapathError;
use crate::freestack::FreeStack;
use crate::msg_id::{MsgId, MsgIdTable};
use crate::packet::{self, CtrlType, HdrFlags, OpCode, PktHdr};
use crate::slab::{ChunkId, SlabPool};
use crate::transport::{
    CompletionSink, ConnHandle, MemoryRegion, MsgTransport, OpContext, RawBuf, RemoteIov,
    WcStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtoState {
    /// Eager; done once the transport reports the send complete.
    #[default]
    None,
    /// The descriptor frame is in flight.
    RendezvousStarted,
    /// The descriptor frame was sent; waiting for the peer to fetch the data.
    AckWait,
}

/// An in-flight outbound operation.
#[derive(Default)]
pub struct TxEntry {
    context: Context,
    flags: OpFlags,
    comp_flags: CompletionFlags,
    len: usize,
    buf: Option<ChunkId>,
    state: ProtoState,
    msg_id: Option<MsgId>,
    /// The ack overtook the local send completion.
    acked: bool,
    /// User segments registered on the caller's behalf.
    mrs: Vec<Box<dyn MemoryRegion>>,
}

/// Arguments of a send, as assembled by the operation layer.
pub struct SendRequest<'a> {
    pub iov: &'a [Iov],
    pub desc: &'a [MemDesc],
    pub op: OpCode,
    pub tag: Tag,
    pub data: u64,
    pub context: Context,
    pub flags: OpFlags,
}

pub struct TxState {
    pool: SlabPool,
    entries: FreeStack<TxEntry>,
    ids: MsgIdTable,
    deferred_acks: VecDeque<(ConnHandle, MsgId)>,
    /// The ack carried by each packet chunk while it is in flight.
    acks: Vec<Option<(ConnHandle, MsgId)>>,
    eager_threshold: usize,
}

fn hdr_flags(flags: OpFlags) -> HdrFlags {
    let mut f = HdrFlags::empty();
    if flags.contains(OpFlags::REMOTE_CQ_DATA) {
        f |= HdrFlags::REMOTE_CQ_DATA;
    }
    if flags.contains(OpFlags::TRANSMIT_COMPLETE) {
        f |= HdrFlags::TRANSMIT_COMPLETE;
    }
    if flags.contains(OpFlags::DELIVERY_COMPLETE) {
        f |= HdrFlags::DELIVERY_COMPLETE;
    }
    f
}

fn write_completion(cq: &dyn CompletionSink, entry: &TxEntry, status: CompletionStatus) {
    // injected sends are never reported, not even on failure
    if entry.flags.contains(OpFlags::INJECT)
        || (status == CompletionStatus::Success && !entry.flags.contains(OpFlags::COMPLETION))
    {
        return;
    }
    let comp = CompletionEntry {
        context: entry.context,
        flags: entry.comp_flags,
        len: entry.len,
        data: 0,
        tag: 0,
        status,
    };
    if let Err(e) = cq.write(comp) {
        warn!(?e, context = ?entry.context, "failed to write send completion");
    }
}

impl TxState {
    pub fn new(pool: SlabPool, size: usize, eager_threshold: usize) -> Self {
        let acks = vec![None; pool.capacity()];
        TxState {
            pool,
            acks,
            entries: FreeStack::new(size),
            ids: MsgIdTable::new(size),
            deferred_acks: VecDeque::new(),
            eager_threshold,
        }
    }

    /// Frames and transmits one send. On any failure everything allocated
    /// for the attempt is released before returning.
    pub fn send(
        &mut self,
        transport: &dyn MsgTransport,
        conn: &ConnHandle,
        req: SendRequest<'_>,
    ) -> Result<(), Error> {
        let index = self
            .entries
            .pop(TxEntry::default())
            .ok_or(Error::ResourceExhausted)?;
        let chunk = match self.pool.acquire() {
            Ok(c) => c,
            Err(e) => {
                self.entries.push(index);
                return Err(e.into());
            }
        };

        match self.frame_and_post(transport, conn, index, chunk, &req) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(%e, index, "send rolled back");
                self.pool.release(chunk);
                self.entries.get_mut(index).expect("entry in use").buf = None;
                self.release_entry(index)?;
                Err(e)
            }
        }
    }

    fn frame_and_post(
        &mut self,
        transport: &dyn MsgTransport,
        conn: &ConnHandle,
        index: u32,
        chunk: ChunkId,
        req: &SendRequest<'_>,
    ) -> Result<(), Error> {
        let total = iov_len(req.iov);
        let mut comp_flags = CompletionFlags::SEND;
        comp_flags |= match req.op {
            OpCode::Msg => CompletionFlags::MSG,
            OpCode::Tagged => CompletionFlags::TAGGED,
        };

        let eager = total <= self.eager_threshold;
        let mut hdr = PktHdr::new(
            if eager {
                CtrlType::Data
            } else {
                CtrlType::LargeData
            },
            conn.remote_key,
        );
        hdr.op.op = req.op as u8;
        hdr.op.flags = hdr_flags(req.flags).bits();
        hdr.op.size = total as u64;
        hdr.op.tag = req.tag;
        if req.flags.contains(OpFlags::REMOTE_CQ_DATA) {
            hdr.op.data = req.data;
        }

        let mut mrs = Vec::new();
        let frame_len = if eager {
            let buf = self.pool.chunk_mut(chunk);
            let mut off = packet::write_hdr(buf, &hdr);
            for iov in req.iov {
                // SAFETY: the caller keeps its segments valid for the
                // duration of the posting call.
                let src = unsafe { iov.as_slice() };
                buf[off..off + src.len()].copy_from_slice(src);
                off += src.len();
            }
            off
        } else {
            if req.flags.contains(OpFlags::INJECT) {
                return Err(Error::MessageTooLarge {
                    size: total,
                    limit: self.eager_threshold,
                });
            }
            let id = self.ids.allocate(index)?;
            self.entries.get_mut(index).expect("entry in use").msg_id = Some(id);
            hdr.ctrl.msg_id = id.0;

            let mut rma = ArrayVec::<RemoteIov, IOV_LIMIT>::new();
            for (i, iov) in req.iov.iter().enumerate() {
                let key = match req.desc.get(i) {
                    Some(d) => d.key,
                    None if transport.requires_local_mr() => {
                        let region = RawBuf {
                            ptr: iov.as_ptr(),
                            len: iov.len(),
                        };
                        // SAFETY: the caller keeps the segment valid until
                        // the send completes, and the registration is dropped
                        // no later than that.
                        let mr = unsafe { transport.register(region) }
                            .map_err(|e| Error::Transport(e.to_string()))?;
                        let key = mr.desc().key;
                        mrs.push(mr);
                        key
                    }
                    None => 0,
                };
                rma.push(RemoteIov {
                    addr: iov.addr(),
                    len: iov.len() as u64,
                    key,
                });
            }
            let buf = self.pool.chunk_mut(chunk);
            packet::write_hdr(buf, &hdr);
            packet::write_rma_iovs(buf, &rma)
        };

        {
            let entry = self.entries.get_mut(index).expect("entry in use");
            entry.context = req.context;
            entry.flags = req.flags;
            entry.comp_flags = comp_flags;
            entry.len = total;
            entry.buf = Some(chunk);
            entry.state = if eager {
                ProtoState::None
            } else {
                ProtoState::RendezvousStarted
            };
            entry.mrs = mrs;
        }

        let raw = self.pool.raw_chunk(chunk, frame_len);
        let wr_id = OpContext::Tx(index).to_wr_id();
        // SAFETY: the chunk stays acquired until the completion for `wr_id`.
        unsafe { transport.post_send(conn, raw, self.pool.desc(), wr_id) }
            .map_err(DatapathError::PostSend)?;

        trace!(index, total, eager, conn = conn.id, "send posted");
        Ok(())
    }

    /// Completion of a send posted by [`TxState::send`].
    pub fn tx_done(
        &mut self,
        transport: &dyn MsgTransport,
        cq: &dyn CompletionSink,
        index: u32,
        status: WcStatus,
    ) -> Result<(), Error> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or_else(|| Error::InvalidArgument(format!("no send record {}", index)))?;
        if let Some(chunk) = entry.buf.take() {
            self.pool.release(chunk);
        }

        let done = match (status, entry.state) {
            (WcStatus::Error(code), _) => {
                warn!(index, code, "send failed");
                write_completion(cq, entry, CompletionStatus::Error(code));
                true
            }
            (WcStatus::Success, ProtoState::None) => {
                write_completion(cq, entry, CompletionStatus::Success);
                true
            }
            (WcStatus::Success, ProtoState::RendezvousStarted) if entry.acked => {
                write_completion(cq, entry, CompletionStatus::Success);
                true
            }
            (WcStatus::Success, ProtoState::RendezvousStarted) => {
                entry.state = ProtoState::AckWait;
                false
            }
            (WcStatus::Success, ProtoState::AckWait) => {
                panic!("send record {} completed twice", index)
            }
        };
        if done {
            self.release_entry(index)?;
        }
        self.flush_deferred_acks(transport);
        Ok(())
    }

    /// The peer finished fetching the data of a rendezvous send.
    pub fn ack_arrived(&mut self, cq: &dyn CompletionSink, id: MsgId) -> Result<(), Error> {
        let index = self.ids.resolve(id)?;
        let entry = self.entries.get_mut(index).expect("message id maps a live record");
        match entry.state {
            ProtoState::RendezvousStarted => {
                trace!(?id, index, "ack before local completion");
                entry.acked = true;
                Ok(())
            }
            ProtoState::AckWait => {
                trace!(?id, index, "rendezvous send complete");
                write_completion(cq, entry, CompletionStatus::Success);
                self.release_entry(index)
            }
            ProtoState::None => Err(Error::InvalidId(id.0)),
        }
    }

    fn release_entry(&mut self, index: u32) -> Result<(), Error> {
        let entry = self.entries.get_mut(index).expect("entry in use");
        entry.mrs.clear();
        entry.acked = false;
        if let Some(id) = entry.msg_id.take() {
            self.ids.release(id)?;
        }
        self.entries.push(index);
        Ok(())
    }

    /// Tells the peer behind `conn` that the data of its rendezvous send
    /// `id` has been fetched. If no packet buffer is free or the transport
    /// refuses the frame, the ack is queued and retried on later completions.
    pub fn send_ack(&mut self, transport: &dyn MsgTransport, conn: ConnHandle, id: MsgId) {
        if let Err(e) = self.post_ack(transport, conn, id) {
            debug!(%e, ?id, "ack deferred");
            self.deferred_acks.push_back((conn, id));
        }
    }

    fn post_ack(
        &mut self,
        transport: &dyn MsgTransport,
        conn: ConnHandle,
        id: MsgId,
    ) -> Result<(), Error> {
        let chunk = self.pool.acquire()?;
        let mut hdr = PktHdr::new(CtrlType::Ack, conn.remote_key);
        hdr.ctrl.msg_id = id.0;
        let len = packet::write_hdr(self.pool.chunk_mut(chunk), &hdr);
        let raw = self.pool.raw_chunk(chunk, len);
        let wr_id = OpContext::Ack(chunk.0).to_wr_id();
        // SAFETY: the chunk stays acquired until the completion for `wr_id`.
        if let Err(e) = unsafe { transport.post_send(&conn, raw, self.pool.desc(), wr_id) } {
            let e = DatapathError::PostSend(e);
            warn!(%e, ?id, "failed to post ack");
            self.pool.release(chunk);
            return Err(e.into());
        }
        self.acks[chunk.0 as usize] = Some((conn, id));
        trace!(?id, conn = conn.id, "ack posted");
        Ok(())
    }

    /// Completion of an ack posted by [`TxState::send_ack`]. A failed ack is
    /// queued again: the peer holds its send record until one arrives.
    pub fn ack_done(&mut self, transport: &dyn MsgTransport, chunk: u32, status: WcStatus) {
        let chunk = ChunkId(chunk);
        let ack = self.acks.get_mut(chunk.0 as usize).and_then(Option::take);
        if self.pool.is_acquired(chunk) {
            self.pool.release(chunk);
        }
        if let WcStatus::Error(code) = status {
            warn!(chunk = chunk.0, code, "ack send failed, retrying");
            if let Some(ack) = ack {
                self.deferred_acks.push_back(ack);
            }
        }
        self.flush_deferred_acks(transport);
    }

    /// Posts queued acks until the queue is empty or one is refused.
    pub fn flush_deferred_acks(&mut self, transport: &dyn MsgTransport) {
        while let Some((conn, id)) = self.deferred_acks.pop_front() {
            if self.post_ack(transport, conn, id).is_err() {
                self.deferred_acks.push_front((conn, id));
                break;
            }
        }
    }

    #[inline]
    pub fn deferred_acks(&self) -> usize {
        self.deferred_acks.len()
    }

    /// Releases every record still in flight.
    pub fn drain(&mut self) -> usize {
        let live: Vec<u32> = self.entries.used_indices().collect();
        for &index in &live {
            let entry = self.entries.get_mut(index).expect("entry in use");
            if let Some(chunk) = entry.buf.take() {
                self.pool.release(chunk);
            }
            if let Err(e) = self.release_entry(index) {
                warn!(%e, index, "send record released with a stale message id");
            }
        }
        self.deferred_acks.clear();
        for ack in self.acks.iter_mut() {
            *ack = None;
        }
        live.len()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.entries.capacity() - self.entries.available()
    }

    #[inline]
    pub fn rendezvous_in_flight(&self) -> usize {
        self.ids.in_use()
    }
}
