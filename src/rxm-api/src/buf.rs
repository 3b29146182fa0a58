//! Descriptions of caller-owned memory.
use std::slice;

use serde::{Deserialize, Serialize};

/// One segment of caller memory, kept as a raw pointer because the engine may
/// touch it after the posting call has returned (receives and rendezvous
/// sends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iov {
    base: *mut u8,
    len: usize,
}

// The engine only dereferences an `Iov` under the contract of the unsafe
// posting operations.
unsafe impl Send for Iov {}
unsafe impl Sync for Iov {}

impl Default for Iov {
    fn default() -> Self {
        Iov {
            base: std::ptr::null_mut(),
            len: 0,
        }
    }
}

impl Iov {
    #[inline]
    pub fn from_slice(buf: &[u8]) -> Self {
        Iov {
            base: buf.as_ptr() as *mut u8,
            len: buf.len(),
        }
    }

    #[inline]
    pub fn from_mut(buf: &mut [u8]) -> Self {
        Iov {
            base: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    /// # Safety
    ///
    /// `base` must be valid for `len` bytes for as long as the engine may use it.
    #[inline]
    pub unsafe fn from_raw_parts(base: *mut u8, len: usize) -> Self {
        Iov { base, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The address of the segment as it is advertised to a peer.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.base as u64
    }

    /// # Safety
    ///
    /// The memory must still be valid and not mutably aliased.
    #[inline]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        slice::from_raw_parts(self.base, self.len)
    }

    /// # Safety
    ///
    /// The memory must still be valid and not aliased.
    #[inline]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        slice::from_raw_parts_mut(self.base, self.len)
    }
}

/// Sum of the lengths of `iov`.
#[inline]
pub fn iov_len(iov: &[Iov]) -> usize {
    iov.iter().map(Iov::len).sum()
}

/// A registration of local memory with the underlying transport.
///
/// `handle` is the local descriptor passed back to transport calls; `key` is
/// the remote access key a peer uses to read the memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MemDesc {
    pub handle: u64,
    pub key: u64,
}

mod sa {
    use super::*;
    use static_assertions::const_assert_eq;
    use std::mem::size_of;

    const_assert_eq!(size_of::<MemDesc>(), 16);
}
