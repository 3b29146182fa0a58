//! Types shared between the rxm engine and its users.
#![allow(missing_docs)]

pub mod buf;
pub use buf::{Iov, MemDesc};

pub mod error;
pub use error::Error;

pub mod net;
pub use net::{Addr, Context, Tag};

/// The maximum number of segments a single operation may carry.
pub const IOV_LIMIT: usize = 4;
