//! The operation sets an endpoint exposes, one trait per capability.
//!
//! Operations that leave caller memory in the engine's hands past the call
//! are `unsafe`: the memory must remain valid, and for receives unaccessed,
//! until the operation's completion is reported or the endpoint is closed.
//! `inject*` copies the payload before returning and is safe.
use std::slice;

use rxm_api::net::{Caps, OpFlags};
use rxm_api::{Addr, Context, Error, Iov, MemDesc, Tag};

use crate::endpoint::Endpoint;
use crate::packet::OpCode;
use crate::recv_queue::QueueKind;
use crate::send::SendRequest;

/// A fully described untagged operation.
#[derive(Debug, Clone, Copy)]
pub struct Msg<'a> {
    pub iov: &'a [Iov],
    pub desc: &'a [MemDesc],
    /// Destination of a send, source filter of a receive.
    pub addr: Addr,
    pub context: Context,
    /// Remote completion data, sent with `OpFlags::REMOTE_CQ_DATA`.
    pub data: u64,
}

/// A fully described tagged operation.
#[derive(Debug, Clone, Copy)]
pub struct TaggedMsg<'a> {
    pub iov: &'a [Iov],
    pub desc: &'a [MemDesc],
    pub addr: Addr,
    pub tag: Tag,
    /// Tag bits a receive does not care about. Ignored on sends.
    pub ignore: Tag,
    pub context: Context,
    pub data: u64,
}

#[inline]
fn one_desc(desc: &Option<MemDesc>) -> &[MemDesc] {
    desc.as_ref().map_or(&[][..], slice::from_ref)
}

pub trait MsgOps {
    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn recv(
        &self,
        buf: &mut [u8],
        desc: Option<MemDesc>,
        src: Addr,
        context: Context,
    ) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn recvv(
        &self,
        iov: &[Iov],
        desc: &[MemDesc],
        src: Addr,
        context: Context,
    ) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn recvmsg(&self, msg: &Msg<'_>, flags: OpFlags) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn send(
        &self,
        buf: &[u8],
        desc: Option<MemDesc>,
        dest: Addr,
        context: Context,
    ) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn sendv(
        &self,
        iov: &[Iov],
        desc: &[MemDesc],
        dest: Addr,
        context: Context,
    ) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn sendmsg(&self, msg: &Msg<'_>, flags: OpFlags) -> Result<(), Error>;

    /// Sends `buf` inline without reporting a completion. Fails with
    /// `MessageTooLarge` above the eager threshold.
    fn inject(&self, buf: &[u8], dest: Addr) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn senddata(
        &self,
        buf: &[u8],
        desc: Option<MemDesc>,
        data: u64,
        dest: Addr,
        context: Context,
    ) -> Result<(), Error>;

    fn injectdata(&self, buf: &[u8], data: u64, dest: Addr) -> Result<(), Error>;
}

pub trait TaggedOps {
    /// # Safety
    ///
    /// See the [module documentation](self).
    #[allow(clippy::too_many_arguments)]
    unsafe fn trecv(
        &self,
        buf: &mut [u8],
        desc: Option<MemDesc>,
        src: Addr,
        tag: Tag,
        ignore: Tag,
        context: Context,
    ) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    #[allow(clippy::too_many_arguments)]
    unsafe fn trecvv(
        &self,
        iov: &[Iov],
        desc: &[MemDesc],
        src: Addr,
        tag: Tag,
        ignore: Tag,
        context: Context,
    ) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn trecvmsg(&self, msg: &TaggedMsg<'_>, flags: OpFlags) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn tsend(
        &self,
        buf: &[u8],
        desc: Option<MemDesc>,
        dest: Addr,
        tag: Tag,
        context: Context,
    ) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn tsendv(
        &self,
        iov: &[Iov],
        desc: &[MemDesc],
        dest: Addr,
        tag: Tag,
        context: Context,
    ) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    unsafe fn tsendmsg(&self, msg: &TaggedMsg<'_>, flags: OpFlags) -> Result<(), Error>;

    fn tinject(&self, buf: &[u8], dest: Addr, tag: Tag) -> Result<(), Error>;

    /// # Safety
    ///
    /// See the [module documentation](self).
    #[allow(clippy::too_many_arguments)]
    unsafe fn tsenddata(
        &self,
        buf: &[u8],
        desc: Option<MemDesc>,
        data: u64,
        dest: Addr,
        tag: Tag,
        context: Context,
    ) -> Result<(), Error>;

    fn tinjectdata(&self, buf: &[u8], data: u64, dest: Addr, tag: Tag) -> Result<(), Error>;
}

impl Endpoint {
    /// The untagged operations, if the endpoint has the `MSG` capability.
    pub fn msg(&self) -> Result<&dyn MsgOps, Error> {
        self.require(Caps::MSG)?;
        Ok(self)
    }

    /// The tagged operations, if the endpoint has the `TAGGED` capability.
    pub fn tagged(&self) -> Result<&dyn TaggedOps, Error> {
        self.require(Caps::TAGGED)?;
        Ok(self)
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn send_one(
        &self,
        op: OpCode,
        iov: &[Iov],
        desc: &[MemDesc],
        dest: Addr,
        tag: Tag,
        data: u64,
        context: Context,
        flags: OpFlags,
    ) -> Result<(), Error> {
        self.require(match op {
            OpCode::Msg => Caps::MSG,
            OpCode::Tagged => Caps::TAGGED,
        })?;
        self.post_send(
            dest,
            SendRequest {
                iov,
                desc,
                op,
                tag,
                data,
                context,
                flags,
            },
        )
    }

    fn inject_one(
        &self,
        op: OpCode,
        buf: &[u8],
        dest: Addr,
        tag: Tag,
        data: u64,
        flags: OpFlags,
    ) -> Result<(), Error> {
        let iov = [Iov::from_slice(buf)];
        // SAFETY: inline sends copy the payload before returning and larger
        // ones are refused.
        unsafe {
            self.send_one(
                op,
                &iov,
                &[],
                dest,
                tag,
                data,
                Context::default(),
                flags | OpFlags::INJECT,
            )
        }
    }
}

impl MsgOps for Endpoint {
    unsafe fn recv(
        &self,
        buf: &mut [u8],
        desc: Option<MemDesc>,
        src: Addr,
        context: Context,
    ) -> Result<(), Error> {
        self.recvv(&[Iov::from_mut(buf)], one_desc(&desc), src, context)
    }

    unsafe fn recvv(
        &self,
        iov: &[Iov],
        desc: &[MemDesc],
        src: Addr,
        context: Context,
    ) -> Result<(), Error> {
        self.require(Caps::MSG)?;
        self.post_recv(QueueKind::Msg, iov, desc, src, 0, 0, context, OpFlags::empty())
    }

    unsafe fn recvmsg(&self, msg: &Msg<'_>, flags: OpFlags) -> Result<(), Error> {
        self.require(Caps::MSG)?;
        self.post_recv(QueueKind::Msg, msg.iov, msg.desc, msg.addr, 0, 0, msg.context, flags)
    }

    unsafe fn send(
        &self,
        buf: &[u8],
        desc: Option<MemDesc>,
        dest: Addr,
        context: Context,
    ) -> Result<(), Error> {
        self.sendv(&[Iov::from_slice(buf)], one_desc(&desc), dest, context)
    }

    unsafe fn sendv(
        &self,
        iov: &[Iov],
        desc: &[MemDesc],
        dest: Addr,
        context: Context,
    ) -> Result<(), Error> {
        self.send_one(OpCode::Msg, iov, desc, dest, 0, 0, context, OpFlags::empty())
    }

    unsafe fn sendmsg(&self, msg: &Msg<'_>, flags: OpFlags) -> Result<(), Error> {
        self.send_one(OpCode::Msg, msg.iov, msg.desc, msg.addr, 0, msg.data, msg.context, flags)
    }

    fn inject(&self, buf: &[u8], dest: Addr) -> Result<(), Error> {
        self.inject_one(OpCode::Msg, buf, dest, 0, 0, OpFlags::empty())
    }

    unsafe fn senddata(
        &self,
        buf: &[u8],
        desc: Option<MemDesc>,
        data: u64,
        dest: Addr,
        context: Context,
    ) -> Result<(), Error> {
        let iov = [Iov::from_slice(buf)];
        self.send_one(
            OpCode::Msg,
            &iov,
            one_desc(&desc),
            dest,
            0,
            data,
            context,
            OpFlags::REMOTE_CQ_DATA,
        )
    }

    fn injectdata(&self, buf: &[u8], data: u64, dest: Addr) -> Result<(), Error> {
        self.inject_one(OpCode::Msg, buf, dest, 0, data, OpFlags::REMOTE_CQ_DATA)
    }
}

impl TaggedOps for Endpoint {
    unsafe fn trecv(
        &self,
        buf: &mut [u8],
        desc: Option<MemDesc>,
        src: Addr,
        tag: Tag,
        ignore: Tag,
        context: Context,
    ) -> Result<(), Error> {
        self.trecvv(&[Iov::from_mut(buf)], one_desc(&desc), src, tag, ignore, context)
    }

    unsafe fn trecvv(
        &self,
        iov: &[Iov],
        desc: &[MemDesc],
        src: Addr,
        tag: Tag,
        ignore: Tag,
        context: Context,
    ) -> Result<(), Error> {
        self.require(Caps::TAGGED)?;
        self.post_recv(QueueKind::Tagged, iov, desc, src, tag, ignore, context, OpFlags::empty())
    }

    unsafe fn trecvmsg(&self, msg: &TaggedMsg<'_>, flags: OpFlags) -> Result<(), Error> {
        self.require(Caps::TAGGED)?;
        self.post_recv(
            QueueKind::Tagged,
            msg.iov,
            msg.desc,
            msg.addr,
            msg.tag,
            msg.ignore,
            msg.context,
            flags,
        )
    }

    unsafe fn tsend(
        &self,
        buf: &[u8],
        desc: Option<MemDesc>,
        dest: Addr,
        tag: Tag,
        context: Context,
    ) -> Result<(), Error> {
        self.tsendv(&[Iov::from_slice(buf)], one_desc(&desc), dest, tag, context)
    }

    unsafe fn tsendv(
        &self,
        iov: &[Iov],
        desc: &[MemDesc],
        dest: Addr,
        tag: Tag,
        context: Context,
    ) -> Result<(), Error> {
        self.send_one(OpCode::Tagged, iov, desc, dest, tag, 0, context, OpFlags::empty())
    }

    unsafe fn tsendmsg(&self, msg: &TaggedMsg<'_>, flags: OpFlags) -> Result<(), Error> {
        self.send_one(
            OpCode::Tagged,
            msg.iov,
            msg.desc,
            msg.addr,
            msg.tag,
            msg.data,
            msg.context,
            flags,
        )
    }

    fn tinject(&self, buf: &[u8], dest: Addr, tag: Tag) -> Result<(), Error> {
        self.inject_one(OpCode::Tagged, buf, dest, tag, 0, OpFlags::empty())
    }

    unsafe fn tsenddata(
        &self,
        buf: &[u8],
        desc: Option<MemDesc>,
        data: u64,
        dest: Addr,
        tag: Tag,
        context: Context,
    ) -> Result<(), Error> {
        let iov = [Iov::from_slice(buf)];
        self.send_one(
            OpCode::Tagged,
            &iov,
            one_desc(&desc),
            dest,
            tag,
            data,
            context,
            OpFlags::REMOTE_CQ_DATA,
        )
    }

    fn tinjectdata(&self, buf: &[u8], data: u64, dest: Addr, tag: Tag) -> Result<(), Error> {
        self.inject_one(OpCode::Tagged, buf, dest, tag, data, OpFlags::REMOTE_CQ_DATA)
    }
}
