use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Resolved address of a peer endpoint.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Addr(pub u64);

impl Addr {
    /// Matches any source when used as a receive filter.
    pub const UNSPEC: Addr = Addr(u64::MAX);

    #[inline]
    pub fn is_unspec(&self) -> bool {
        *self == Self::UNSPEC
    }
}

/// The caller's opaque identity for an operation, echoed in its completion.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Context(pub u64);

pub type Tag = u64;

bitflags! {
    /// Per-operation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct OpFlags: u64 {
        /// Report a completion entry for this operation.
        const COMPLETION = 1 << 0;
        /// Copy the payload inline and never fall back to rendezvous.
        const INJECT = 1 << 1;
        /// Carry remote completion data to the receiver.
        const REMOTE_CQ_DATA = 1 << 2;
        const TRANSMIT_COMPLETE = 1 << 3;
        const DELIVERY_COMPLETE = 1 << 4;
    }

    /// Capabilities an endpoint is configured with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Caps: u64 {
        const MSG = 1 << 0;
        const TAGGED = 1 << 1;
        /// Honor the source address filter of posted receives.
        const DIRECTED_RECV = 1 << 2;
    }

    /// Roles a completion sink is bound for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BindFlags: u64 {
        const TRANSMIT = 1 << 0;
        const RECV = 1 << 1;
        /// Only operations posted with `OpFlags::COMPLETION` report completions.
        const SELECTIVE_COMPLETION = 1 << 2;
    }

    /// Flags of a reported completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CompletionFlags: u64 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const MSG = 1 << 2;
        const TAGGED = 1 << 3;
        const REMOTE_CQ_DATA = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Success,
    /// The message did not fit the posted buffers; `overflow` bytes were dropped.
    Truncated { overflow: usize },
    /// The transport failed the operation with a vendor-specific code.
    Error(u32),
}

/// A completion reported to a bound completion sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEntry {
    pub context: Context,
    pub flags: CompletionFlags,
    pub len: usize,
    pub data: u64,
    pub tag: Tag,
    pub status: CompletionStatus,
}

impl CompletionEntry {
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}
