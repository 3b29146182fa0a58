use std::io;

use thiserror::Error;

pub use rxm_api::Error;

use crate::msg_id::Error as MsgIdError;
use crate::packet::Error as PacketError;
use crate::slab::Error as SlabError;

impl From<SlabError> for Error {
    fn from(other: SlabError) -> Self {
        match other {
            SlabError::Exhausted => Error::ResourceExhausted,
            e @ SlabError::InvalidLayout { .. } => Error::InvalidArgument(e.to_string()),
            SlabError::Mmap(e) | SlabError::Register(e) => Error::Transport(e.to_string()),
        }
    }
}

impl From<MsgIdError> for Error {
    fn from(other: MsgIdError) -> Self {
        match other {
            MsgIdError::Exhausted => Error::ResourceExhausted,
            MsgIdError::InvalidId(id) => Error::InvalidId(id),
        }
    }
}

impl From<PacketError> for Error {
    fn from(other: PacketError) -> Self {
        match other {
            PacketError::CtrlVersion(found) => Error::VersionMismatch {
                expected: crate::packet::CTRL_VERSION,
                found,
            },
            PacketError::OpVersion(found) => Error::VersionMismatch {
                expected: crate::packet::OP_VERSION,
                found,
            },
            e => Error::InvalidArgument(e.to_string()),
        }
    }
}

/// Failures surfaced by the transport while posting work.
#[derive(Debug, Error)]
pub(crate) enum DatapathError {
    #[error("post_send failed: {0}")]
    PostSend(io::Error),
    #[error("post_recv failed: {0}")]
    PostRecv(io::Error),
    #[error("post_read failed: {0}")]
    PostRead(io::Error),
}

impl From<DatapathError> for Error {
    fn from(other: DatapathError) -> Self {
        Error::Transport(other.to_string())
    }
}

impl DatapathError {
    /// The code reported in an error completion.
    pub(crate) fn as_vendor_err(&self) -> u32 {
        let e = match self {
            Self::PostSend(e) | Self::PostRecv(e) | Self::PostRead(e) => e,
        };
        e.raw_os_error().map_or(1024, |x| x as u32)
    }
}
