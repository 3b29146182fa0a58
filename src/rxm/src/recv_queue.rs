//! Posted receives, unexpected arrivals and the matching between them.
//!
//! Every method here runs under the endpoint's receive lock, so a
//! scan-then-remove on one FIFO is atomic with respect to the other path.
use std::collections::VecDeque;

use arrayvec::ArrayVec;
use tracing::trace;

use rxm_api::net::OpFlags;
use rxm_api::{Addr, Context, Error, Iov, MemDesc, Tag, IOV_LIMIT};

use crate::freestack::FreeStack;
use crate::slab::ChunkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Msg,
    Tagged,
}

/// A posted receive.
#[derive(Debug, Clone)]
pub struct RecvEntry {
    pub iov: ArrayVec<(Iov, Option<MemDesc>), IOV_LIMIT>,
    /// Source filter, `Addr::UNSPEC` for any.
    pub addr: Addr,
    pub tag: Tag,
    pub ignore: Tag,
    pub flags: OpFlags,
    pub context: Context,
}

impl Default for RecvEntry {
    fn default() -> Self {
        RecvEntry {
            iov: ArrayVec::new(),
            addr: Addr::UNSPEC,
            tag: 0,
            ignore: 0,
            flags: OpFlags::empty(),
            context: Context::default(),
        }
    }
}

impl RecvEntry {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.iov.iter().map(|(iov, _)| iov.len()).sum()
    }
}

/// An arrived message no receive was posted for. It keeps the receive buffer
/// holding its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnexpMsg {
    pub addr: Addr,
    pub tag: Tag,
    pub buf: ChunkId,
}

#[inline]
pub fn match_addr(filter: Addr, addr: Addr) -> bool {
    filter.is_unspec() || filter == addr
}

/// Bits set in `ignore` are wildcarded on both sides.
#[inline]
pub fn match_tag(tag: Tag, ignore: Tag, incoming: Tag) -> bool {
    (tag & !ignore) == (incoming & !ignore)
}

/// Outcome of posting a receive.
#[derive(Debug, PartialEq, Eq)]
pub enum Posted {
    /// Bound to an unexpected message, which has been removed from its FIFO.
    Matched(u32, UnexpMsg),
    Queued(u32),
}

/// Outcome of an arrival.
#[derive(Debug, PartialEq, Eq)]
pub enum Arrival {
    /// Bound to a posted receive, which has been removed from its FIFO.
    Matched(u32, UnexpMsg),
    Unexpected,
}

pub struct RecvQueue {
    kind: QueueKind,
    entries: FreeStack<RecvEntry>,
    posted: VecDeque<u32>,
    unexp: VecDeque<UnexpMsg>,
}

impl RecvQueue {
    pub fn new(kind: QueueKind, size: usize) -> Self {
        RecvQueue {
            kind,
            entries: FreeStack::new(size),
            posted: VecDeque::with_capacity(size),
            unexp: VecDeque::new(),
        }
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    fn matches(&self, entry: &RecvEntry, addr: Addr, tag: Tag) -> bool {
        match_addr(entry.addr, addr)
            && (self.kind == QueueKind::Msg || match_tag(entry.tag, entry.ignore, tag))
    }

    /// Posts a receive, binding it to the first matching unexpected message
    /// if there is one.
    ///
    /// Fails with `ResourceExhausted` and changes nothing if no descriptor is
    /// free, or if a match exists but `can_complete` is `false`.
    pub fn post(&mut self, entry: RecvEntry, can_complete: bool) -> Result<Posted, Error> {
        let index = self.entries.pop(entry).ok_or(Error::ResourceExhausted)?;
        let entry = self.entries.get(index).expect("just allocated");
        let pos = self
            .unexp
            .iter()
            .position(|m| self.matches(entry, m.addr, m.tag));
        match pos {
            Some(_) if !can_complete => {
                self.entries.push(index);
                Err(Error::ResourceExhausted)
            }
            Some(pos) => {
                let msg = self.unexp.remove(pos).expect("position in range");
                trace!(kind = ?self.kind, index, ?msg, "receive matched unexpected message");
                Ok(Posted::Matched(index, msg))
            }
            None => {
                self.posted.push_back(index);
                Ok(Posted::Queued(index))
            }
        }
    }

    /// Matches an arrived message against the posted receives, queueing it as
    /// unexpected on a miss.
    pub fn arrival(&mut self, msg: UnexpMsg) -> Arrival {
        let pos = self.posted.iter().position(|&i| {
            let entry = self.entries.get(i).expect("posted entry in use");
            self.matches(entry, msg.addr, msg.tag)
        });
        match pos {
            Some(pos) => {
                let index = self.posted.remove(pos).expect("position in range");
                trace!(kind = ?self.kind, index, ?msg, "arrival matched posted receive");
                Arrival::Matched(index, msg)
            }
            None => {
                trace!(kind = ?self.kind, ?msg, "unexpected message");
                self.unexp.push_back(msg);
                Arrival::Unexpected
            }
        }
    }

    /// # Panics
    ///
    /// Panics if `index` is not a bound descriptor.
    #[inline]
    pub fn entry(&self, index: u32) -> &RecvEntry {
        self.entries.get(index).expect("receive entry not in use")
    }

    /// Returns a bound descriptor to the free list.
    #[inline]
    pub fn release(&mut self, index: u32) {
        debug_assert!(!self.posted.contains(&index));
        self.entries.push(index);
    }

    #[inline]
    pub fn posted_len(&self) -> usize {
        self.posted.len()
    }

    #[inline]
    pub fn unexpected_len(&self) -> usize {
        self.unexp.len()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.entries.available()
    }

    /// Frees every posted descriptor and empties the unexpected FIFO,
    /// returning the buffers the unexpected messages held.
    pub fn drain(&mut self) -> Vec<ChunkId> {
        while let Some(index) = self.posted.pop_front() {
            self.entries.push(index);
        }
        self.unexp.drain(..).map(|m| m.buf).collect()
    }
}
