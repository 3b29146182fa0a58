//! Wire format of the frames exchanged between two endpoints.
//!
//! ```text
//! | ctrl header | op header | payload                                    |
//! |     16      |    32     | eager: `size` inline bytes                 |
//! |             |           | large data: count, rsvd, count x rma iov   |
//! |             |           | ack: empty                                 |
//! ```
//!
//! Fields are in host byte order; both peers are assumed to share it. Each
//! header carries a version that is checked on receipt.
use arrayvec::ArrayVec;
use bitflags::bitflags;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use rxm_api::IOV_LIMIT;

use crate::transport::RemoteIov;

pub const CTRL_VERSION: u8 = 3;
pub const OP_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Frame of {have} bytes is shorter than {need}")]
    Truncated { need: usize, have: usize },
    #[error("Control header version {0}")]
    CtrlVersion(u8),
    #[error("Op header version {0}")]
    OpVersion(u8),
    #[error("Unknown control type {0}")]
    UnknownType(u8),
    #[error("Unknown op code {0}")]
    UnknownOp(u8),
    #[error("Too many rma iovs: {0}")]
    TooManyIovs(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtrlType {
    Data = 1,
    LargeData = 2,
    Ack = 3,
}

impl TryFrom<u8> for CtrlType {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            1 => Ok(CtrlType::Data),
            2 => Ok(CtrlType::LargeData),
            3 => Ok(CtrlType::Ack),
            _ => Err(Error::UnknownType(v)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Msg = 1,
    Tagged = 2,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            1 => Ok(OpCode::Msg),
            2 => Ok(OpCode::Tagged),
            _ => Err(Error::UnknownOp(v)),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HdrFlags: u16 {
        const REMOTE_CQ_DATA = 1 << 0;
        const TRANSMIT_COMPLETE = 1 << 1;
        const DELIVERY_COMPLETE = 1 << 2;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct CtrlHdr {
    pub version: u8,
    pub ty: u8,
    pub rsvd: u16,
    /// The key the receiver assigned to the connection.
    pub conn_id: u32,
    /// Rendezvous correlation, zero on eager frames.
    pub msg_id: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct OpHdr {
    pub version: u8,
    pub op: u8,
    pub flags: u16,
    pub rsvd: u32,
    pub size: u64,
    pub tag: u64,
    pub data: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
pub struct PktHdr {
    pub ctrl: CtrlHdr,
    pub op: OpHdr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromZeroes, FromBytes)]
struct RmaIovHdr {
    count: u32,
    rsvd: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromZeroes, FromBytes)]
struct RmaIov {
    addr: u64,
    len: u64,
    key: u64,
}

pub const PKT_HDR_LEN: usize = std::mem::size_of::<PktHdr>();
const RMA_HDR_LEN: usize = std::mem::size_of::<RmaIovHdr>();
const RMA_IOV_LEN: usize = std::mem::size_of::<RmaIov>();

/// The largest rendezvous payload.
pub const MAX_RMA_LEN: usize = RMA_HDR_LEN + IOV_LIMIT * RMA_IOV_LEN;

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;
    use std::mem::size_of;

    const_assert_eq!(size_of::<CtrlHdr>(), 16);
    const_assert_eq!(size_of::<OpHdr>(), 32);
    const_assert_eq!(size_of::<PktHdr>(), 48);
    const_assert_eq!(size_of::<RmaIov>(), 24);
}

impl PktHdr {
    pub fn new(ty: CtrlType, conn_id: u32) -> Self {
        PktHdr {
            ctrl: CtrlHdr {
                version: CTRL_VERSION,
                ty: ty as u8,
                conn_id,
                ..Default::default()
            },
            op: OpHdr {
                version: OP_VERSION,
                ..Default::default()
            },
        }
    }

    #[inline]
    pub fn ctrl_type(&self) -> Result<CtrlType, Error> {
        CtrlType::try_from(self.ctrl.ty)
    }

    #[inline]
    pub fn op_code(&self) -> Result<OpCode, Error> {
        OpCode::try_from(self.op.op)
    }

    #[inline]
    pub fn flags(&self) -> HdrFlags {
        HdrFlags::from_bits_truncate(self.op.flags)
    }
}

/// A decoded payload, borrowing from the frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Eager(&'a [u8]),
    Rendezvous(ArrayVec<RemoteIov, IOV_LIMIT>),
    Ack,
}

/// Validates and decodes a frame.
pub fn parse(buf: &[u8]) -> Result<(PktHdr, Frame<'_>), Error> {
    let hdr = PktHdr::read_from_prefix(buf).ok_or(Error::Truncated {
        need: PKT_HDR_LEN,
        have: buf.len(),
    })?;
    if hdr.ctrl.version != CTRL_VERSION {
        return Err(Error::CtrlVersion(hdr.ctrl.version));
    }
    if hdr.op.version != OP_VERSION {
        return Err(Error::OpVersion(hdr.op.version));
    }
    let body = &buf[PKT_HDR_LEN..];
    let frame = match hdr.ctrl_type()? {
        CtrlType::Ack => Frame::Ack,
        ty => {
            hdr.op_code()?;
            if ty == CtrlType::Data {
                let size = hdr.op.size as usize;
                if body.len() < size {
                    return Err(Error::Truncated {
                        need: PKT_HDR_LEN + size,
                        have: buf.len(),
                    });
                }
                Frame::Eager(&body[..size])
            } else {
                Frame::Rendezvous(parse_rma_iovs(body)?)
            }
        }
    };
    Ok((hdr, frame))
}

fn parse_rma_iovs(body: &[u8]) -> Result<ArrayVec<RemoteIov, IOV_LIMIT>, Error> {
    let truncated = |need| Error::Truncated {
        need: PKT_HDR_LEN + need,
        have: PKT_HDR_LEN + body.len(),
    };
    let rh = RmaIovHdr::read_from_prefix(body).ok_or_else(|| truncated(RMA_HDR_LEN))?;
    if rh.count as usize > IOV_LIMIT {
        return Err(Error::TooManyIovs(rh.count));
    }
    let need = RMA_HDR_LEN + rh.count as usize * RMA_IOV_LEN;
    if body.len() < need {
        return Err(truncated(need));
    }
    let mut iovs = ArrayVec::new();
    for i in 0..rh.count as usize {
        let off = RMA_HDR_LEN + i * RMA_IOV_LEN;
        let iov = RmaIov::read_from_prefix(&body[off..]).ok_or_else(|| truncated(need))?;
        iovs.push(RemoteIov {
            addr: iov.addr,
            len: iov.len,
            key: iov.key,
        });
    }
    Ok(iovs)
}

/// Writes the header, returning the offset of the payload.
///
/// # Panics
///
/// Panics if `buf` cannot hold the header.
#[inline]
pub fn write_hdr(buf: &mut [u8], hdr: &PktHdr) -> usize {
    hdr.write_to_prefix(buf).expect("buffer too small for header");
    PKT_HDR_LEN
}

/// Writes the descriptor list of a large-data frame after the header,
/// returning the total frame length.
///
/// # Panics
///
/// Panics if `buf` is too small or more than `IOV_LIMIT` descriptors are given.
pub fn write_rma_iovs(buf: &mut [u8], iovs: &[RemoteIov]) -> usize {
    assert!(iovs.len() <= IOV_LIMIT);
    let body = &mut buf[PKT_HDR_LEN..];
    RmaIovHdr {
        count: iovs.len() as u32,
        rsvd: 0,
    }
    .write_to_prefix(body)
    .expect("buffer too small for rma header");
    for (i, iov) in iovs.iter().enumerate() {
        let off = RMA_HDR_LEN + i * RMA_IOV_LEN;
        RmaIov {
            addr: iov.addr,
            len: iov.len,
            key: iov.key,
        }
        .write_to_prefix(&mut body[off..])
        .expect("buffer too small for rma iov");
    }
    PKT_HDR_LEN + RMA_HDR_LEN + iovs.len() * RMA_IOV_LEN
}
