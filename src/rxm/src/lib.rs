//! Reliable tagged messaging emulated over a plain point-to-point transport.
//!
//! An [`Endpoint`] layers posted-receive matching, masked tag matching and an
//! eager/rendezvous send protocol on top of any [`MsgTransport`] that can
//! send, receive and read remote memory. No thread is spawned for progress:
//! whoever polls the transport feeds each [`WorkCompletion`] to
//! [`Endpoint::handle_completion`].

pub use rxm_api::Error;

pub mod config;
pub mod logging;

pub mod transport;
pub use transport::{
    CompletionSink, ConnHandle, ConnectionResolver, MemoryRegion, MsgTransport, OpContext,
    RawBuf, RemoteIov, WcStatus, WorkCompletion,
};

pub mod freestack;
pub mod msg_id;
pub mod packet;
pub mod recv_queue;
pub use recv_queue::QueueKind;
pub mod slab;

pub(crate) mod completion;
pub(crate) mod error;
pub(crate) mod send;

pub mod endpoint;
pub use endpoint::Endpoint;

pub mod fabric;
pub use fabric::{Fabric, FabricAttr, FabricFactory};

pub mod ops;
pub use ops::{Msg, MsgOps, TaggedMsg, TaggedOps};
