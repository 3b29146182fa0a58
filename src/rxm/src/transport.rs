//! Contracts with the collaborators the engine is layered on: the
//! point-to-point message transport, connection/address resolution and the
//! completion sinks.
//!
//! Completions of transport operations are reported out-of-band. Whoever
//! drives progress hands every [`WorkCompletion`] to
//! [`Endpoint::handle_completion`](crate::Endpoint::handle_completion); no
//! transport call may re-enter the endpoint synchronously.
use std::io;

use rxm_api::net::CompletionEntry;
use rxm_api::{Addr, Error, MemDesc};

/// A connection to a peer, as resolved by a [`ConnectionResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    /// The transport-level handle to send on.
    pub id: u64,
    /// The key the peer assigned to this connection. It travels in every
    /// control header so the peer can identify the sender.
    pub remote_key: u32,
}

/// A raw view into engine-owned memory handed to the transport.
#[derive(Debug, Clone, Copy)]
pub struct RawBuf {
    pub ptr: *mut u8,
    pub len: usize,
}

unsafe impl Send for RawBuf {}
unsafe impl Sync for RawBuf {}

/// Remote memory named by a rendezvous descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteIov {
    pub addr: u64,
    pub len: u64,
    pub key: u64,
}

/// Memory registered with the transport. Dropping it deregisters the memory.
pub trait MemoryRegion: Send + Sync {
    fn desc(&self) -> MemDesc;
}

/// The lower-level transport offering only raw send/receive and remote read.
pub trait MsgTransport: Send + Sync {
    /// Returns `true` if send and receive buffers must be registered and
    /// their descriptors passed to every call.
    fn requires_local_mr(&self) -> bool;

    /// Registers `region` for local and remote access.
    ///
    /// # Safety
    ///
    /// `region` must stay valid until the returned [`MemoryRegion`] is dropped.
    unsafe fn register(&self, region: RawBuf) -> io::Result<Box<dyn MemoryRegion>>;

    /// # Safety
    ///
    /// `buf` must stay valid until a work completion carrying `wr_id` has been
    /// reported.
    unsafe fn post_send(
        &self,
        conn: &ConnHandle,
        buf: RawBuf,
        desc: Option<MemDesc>,
        wr_id: u64,
    ) -> io::Result<()>;

    /// # Safety
    ///
    /// `buf` must stay valid and unaliased until a work completion carrying
    /// `wr_id` has been reported.
    unsafe fn post_recv(&self, buf: RawBuf, desc: Option<MemDesc>, wr_id: u64) -> io::Result<()>;

    /// Reads `remote` from the peer behind `conn` into `local`.
    ///
    /// # Safety
    ///
    /// `local` must stay valid and unaliased until a work completion carrying
    /// `wr_id` has been reported.
    unsafe fn post_read(
        &self,
        conn: &ConnHandle,
        local: RawBuf,
        desc: Option<MemDesc>,
        remote: RemoteIov,
        wr_id: u64,
    ) -> io::Result<()>;
}

/// Connection establishment and the address table, both owned outside the
/// engine.
pub trait ConnectionResolver: Send + Sync {
    /// Returns a connection to `addr`, establishing it if needed. Errors are
    /// propagated to the caller of the send verbatim.
    fn resolve(&self, addr: Addr) -> Result<ConnHandle, Error>;

    /// Maps the connection id found in an incoming control header back to
    /// the peer's address and a connection to it.
    fn lookup(&self, conn_id: u32) -> Option<(Addr, ConnHandle)>;
}

/// Where completions of endpoint operations are reported.
pub trait CompletionSink: Send + Sync {
    fn is_full(&self) -> bool;

    fn write(&self, entry: CompletionEntry) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Error(u32),
}

/// Completion of a transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub byte_len: u32,
}

impl WorkCompletion {
    #[inline]
    pub fn success(wr_id: u64, byte_len: u32) -> Self {
        WorkCompletion {
            wr_id,
            status: WcStatus::Success,
            byte_len,
        }
    }
}

/// What a work request id refers to. Encoded into the `u64` id handed to the
/// transport so a completion recovers its record without pointer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpContext {
    /// An outbound operation, by send-record index.
    Tx(u32),
    /// A receive buffer, by chunk index in the receive pool.
    Rx(u32),
    /// A rendezvous read, by the receive buffer chunk it serves.
    Read(u32),
    /// An acknowledgment frame, by chunk index in the send pool.
    Ack(u32),
}

impl OpContext {
    const KIND_SHIFT: u32 = 56;

    #[inline]
    pub fn to_wr_id(self) -> u64 {
        let (kind, index) = match self {
            OpContext::Tx(i) => (1u64, i),
            OpContext::Rx(i) => (2, i),
            OpContext::Read(i) => (3, i),
            OpContext::Ack(i) => (4, i),
        };
        (kind << Self::KIND_SHIFT) | index as u64
    }

    #[inline]
    pub fn from_wr_id(wr_id: u64) -> Option<Self> {
        let index = (wr_id & u32::MAX as u64) as u32;
        match wr_id >> Self::KIND_SHIFT {
            1 => Some(OpContext::Tx(index)),
            2 => Some(OpContext::Rx(index)),
            3 => Some(OpContext::Read(index)),
            4 => Some(OpContext::Ack(index)),
            _ => None,
        }
    }
}
