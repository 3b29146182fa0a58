mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rxm::config::EndpointAttr;
use rxm::packet::{self, CtrlType, OpCode, PktHdr, PKT_HDR_LEN};
use rxm::{ConnHandle, Endpoint, MsgOps, MsgTransport, QueueKind, RawBuf, TaggedOps};
use rxm_api::net::{BindFlags, Caps, OpFlags};
use rxm_api::{Addr, Context, Error};

use common::*;

fn lone_endpoint(attr: EndpointAttr) -> (Arc<Network>, rxm::FabricFactory, Endpoint) {
    let net = Network::new(2);
    let factory = rxm::FabricFactory::new();
    let fabric = factory.open(&fabric_attr()).unwrap();
    let (ep, _) = open(&fabric, &net, 0, attr, false);
    (net, factory, ep)
}

#[test]
fn enable_requires_every_binding() {
    let (net, _factory, ep) = lone_endpoint(small_attr());

    assert_eq!(
        ep.enable(),
        Err(Error::MissingResource("transmit completion queue"))
    );
    ep.bind_cq(TestCq::new(8), BindFlags::TRANSMIT).unwrap();
    assert_eq!(
        ep.enable(),
        Err(Error::MissingResource("receive completion queue"))
    );
    ep.bind_cq(TestCq::new(8), BindFlags::RECV).unwrap();
    assert_eq!(ep.enable(), Err(Error::MissingResource("address vector")));
    assert_eq!(net.posted_recvs(0), 0);
    assert!(!ep.is_enabled());

    ep.bind_av(Arc::new(StaticAv::new(0, 2))).unwrap();
    ep.enable().unwrap();
    assert!(ep.is_enabled());
    assert_eq!(net.posted_recvs(0), 16);
    // enabling twice posts nothing more
    ep.enable().unwrap();
    assert_eq!(net.posted_recvs(0), 16);
}

#[test]
fn roles_bind_at_most_once() {
    let (_net, _factory, ep) = lone_endpoint(small_attr());

    ep.bind_cq(TestCq::new(8), BindFlags::TRANSMIT).unwrap();
    assert_eq!(
        ep.bind_cq(TestCq::new(8), BindFlags::TRANSMIT | BindFlags::RECV),
        Err(Error::DuplicateBinding("transmit completion queue"))
    );
    // the failed bind left the receive role free
    ep.bind_cq(TestCq::new(8), BindFlags::RECV).unwrap();
    assert_eq!(
        ep.bind_cq(TestCq::new(8), BindFlags::RECV),
        Err(Error::DuplicateBinding("receive completion queue"))
    );

    ep.bind_av(Arc::new(StaticAv::new(0, 2))).unwrap();
    assert_eq!(
        ep.bind_av(Arc::new(StaticAv::new(0, 2))),
        Err(Error::DuplicateBinding("address vector"))
    );

    let bogus = BindFlags::from_bits_retain(1 << 20);
    assert!(matches!(
        ep.bind_cq(TestCq::new(8), bogus),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn missing_capability_is_unsupported() {
    let c = Cluster::new(
        2,
        EndpointAttr {
            caps: Caps::MSG,
            ..small_attr()
        },
    );
    let (a, b) = (&c.peers[0], &c.peers[1]);
    assert!(matches!(a.ep.tagged(), Err(Error::Unsupported)));
    assert!(a.ep.msg().is_ok());
    assert_eq!(a.ep.tinject(b"x", b.addr(), 1), Err(Error::Unsupported));
    let mut buf = [0u8; 4];
    let res = unsafe { b.ep.trecv(&mut buf, None, Addr::UNSPEC, 0, 0, Context(0)) };
    assert_eq!(res, Err(Error::Unsupported));
    assert_eq!(b.ep.posted_len(QueueKind::Tagged), 0);

    let c = Cluster::new(
        1,
        EndpointAttr {
            caps: Caps::TAGGED,
            ..small_attr()
        },
    );
    let ep = &c.peers[0].ep;
    assert!(matches!(ep.msg(), Err(Error::Unsupported)));
    let ops = ep.tagged().unwrap();
    ops.tinject(b"self", Addr(0), 0).unwrap();
}

#[test]
fn operations_need_an_enabled_endpoint() {
    let (_net, _factory, ep) = lone_endpoint(small_attr());
    assert_eq!(ep.inject(b"x", Addr(1)), Err(Error::NotEnabled));
    let mut buf = [0u8; 4];
    let res = unsafe { ep.recv(&mut buf, None, Addr::UNSPEC, Context(0)) };
    assert_eq!(res, Err(Error::NotEnabled));
    let wc = rxm::WorkCompletion::success(rxm::OpContext::Rx(0).to_wr_id(), 0);
    assert_eq!(ep.handle_completion(wc), Err(Error::NotEnabled));
}

#[test]
fn selective_completion_reports_only_flagged_operations() {
    let net = Network::new(2);
    let factory = rxm::FabricFactory::new();
    let fabric = factory.open(&fabric_attr()).unwrap();
    let (a, _) = open(&fabric, &net, 0, small_attr(), false);
    let (b, _) = open(&fabric, &net, 1, small_attr(), false);
    let tx_cq = TestCq::new(8);
    a.bind_cq(
        tx_cq.clone(),
        BindFlags::TRANSMIT | BindFlags::SELECTIVE_COMPLETION,
    )
    .unwrap();
    a.bind_cq(TestCq::new(8), BindFlags::RECV).unwrap();
    a.bind_av(Arc::new(StaticAv::new(0, 2))).unwrap();
    a.enable().unwrap();
    bind_and_enable(&b, 1, 2);

    unsafe {
        a.send(b"quiet", None, Addr(1), Context(1)).unwrap();
        let iov = [rxm_api::Iov::from_slice(b"loud")];
        let msg = rxm::Msg {
            iov: &iov,
            desc: &[],
            addr: Addr(1),
            context: Context(2),
            data: 0,
        };
        a.sendmsg(&msg, OpFlags::COMPLETION).unwrap();
    }
    for wc in net.take_completions(0) {
        a.handle_completion(wc).unwrap();
    }
    let comps = tx_cq.drain();
    assert_eq!(comps.len(), 1);
    assert_eq!(comps[0].context, Context(2));
    assert_eq!(a.tx_in_flight(), 0);
}

#[test]
fn close_drains_queues() {
    let c = Cluster::new(2, small_attr());
    let (a, b) = (&c.peers[0], &c.peers[1]);

    a.ep.inject(b"early", b.addr()).unwrap();
    a.ep.tinject(b"early", b.addr(), 4).unwrap();
    assert!(c.progress().is_empty());
    let mut bufs = [[0u8; 8]; 3];
    for buf in bufs.iter_mut() {
        unsafe { b.ep.trecv(buf, None, Addr::UNSPEC, 5, 0, Context(0)).unwrap() };
    }
    assert_eq!(b.ep.posted_len(QueueKind::Tagged), 3);
    assert_eq!(b.ep.unexpected_len(QueueKind::Msg), 1);

    b.ep.close();
    assert!(!b.ep.is_enabled());
    assert_eq!(b.ep.posted_len(QueueKind::Tagged), 0);
    assert_eq!(b.ep.unexpected_len(QueueKind::Msg), 0);
    assert_eq!(b.ep.unexpected_len(QueueKind::Tagged), 0);
    assert_eq!(b.ep.inject(b"late", a.addr()), Err(Error::NotEnabled));
    assert_eq!(b.ep.enable(), Err(Error::NotEnabled));
    b.ep.close();
}

#[test]
fn endpoints_hold_the_fabric() {
    let c = Cluster::new(2, small_attr());
    assert_eq!(c.factory.refcount(), 3);
    let again = c.factory.open(&fabric_attr()).unwrap();
    assert!(Arc::ptr_eq(&again, &c.fabric));
    assert!(Arc::ptr_eq(c.peers[0].ep.fabric(), &c.fabric));
    drop(again);
    let Cluster {
        factory,
        fabric,
        peers,
        ..
    } = c;
    drop(fabric);
    assert_eq!(factory.refcount(), 2);
    drop(peers);
    assert_eq!(factory.refcount(), 0);
}

fn inject_raw(c: &Cluster, from: usize, to: usize, hdr: &PktHdr, payload: &[u8]) {
    let mut frame = vec![0u8; PKT_HDR_LEN + payload.len()];
    packet::write_hdr(&mut frame, hdr);
    frame[PKT_HDR_LEN..].copy_from_slice(payload);
    let conn = ConnHandle {
        id: to as u64,
        remote_key: from as u32,
    };
    let raw = RawBuf {
        ptr: frame.as_mut_ptr(),
        len: frame.len(),
    };
    unsafe { c.peers[from].transport.post_send(&conn, raw, None, u64::MAX) }.unwrap();
    // drop the bogus local completion
    c.net.take_completions(from);
}

#[test]
fn bad_frames_are_dropped_and_buffers_recycled() {
    let c = Cluster::new(2, small_attr());
    let b = &c.peers[1];
    assert_eq!(c.net.posted_recvs(1), 16);

    let mut hdr = PktHdr::new(CtrlType::Data, 0);
    hdr.op.op = OpCode::Msg as u8;
    hdr.ctrl.version = 99;
    inject_raw(&c, 0, 1, &hdr, b"");
    assert_eq!(
        c.progress(),
        vec![Error::VersionMismatch {
            expected: packet::CTRL_VERSION,
            found: 99
        }]
    );

    let mut hdr = PktHdr::new(CtrlType::Data, 0);
    hdr.op.op = OpCode::Msg as u8;
    hdr.op.size = 10;
    inject_raw(&c, 0, 1, &hdr, b"short");
    assert!(matches!(c.progress()[..], [Error::InvalidArgument(_)]));

    let mut hdr = PktHdr::new(CtrlType::Data, 50);
    hdr.op.op = OpCode::Msg as u8;
    inject_raw(&c, 0, 1, &hdr, b"");
    assert!(matches!(c.progress()[..], [Error::InvalidArgument(_)]));

    let mut hdr = PktHdr::new(CtrlType::Ack, 0);
    hdr.ctrl.msg_id = 12345;
    inject_raw(&c, 0, 1, &hdr, b"");
    assert_eq!(c.progress(), vec![Error::InvalidId(12345)]);

    assert_eq!(c.net.posted_recvs(1), 16);
    assert_eq!(b.ep.unexpected_len(QueueKind::Msg), 0);
}

#[test]
fn refused_receive_buffers_are_retried() {
    let c = Cluster::new(2, small_attr());
    let (a, b) = (&c.peers[0], &c.peers[1]);

    b.transport.fail_recvs.store(true, Ordering::SeqCst);
    let mut buf = [0u8; 8];
    unsafe { b.ep.recv(&mut buf, None, Addr::UNSPEC, Context(0)).unwrap() };
    a.ep.inject(b"one", b.addr()).unwrap();
    assert!(c.progress().is_empty());
    assert_eq!(b.ep.stalled_buffers(), 1);
    assert_eq!(c.net.posted_recvs(1), 15);

    b.transport.fail_recvs.store(false, Ordering::SeqCst);
    a.ep.inject(b"two", b.addr()).unwrap();
    assert!(c.progress().is_empty());
    assert_eq!(b.ep.stalled_buffers(), 0);
    assert_eq!(c.net.posted_recvs(1), 15);
    assert_eq!(b.ep.unexpected_len(QueueKind::Msg), 1);
}

#[test]
fn failed_reads_complete_with_an_error() {
    let c = Cluster::new(2, small_attr());
    let (a, b) = (&c.peers[0], &c.peers[1]);

    b.transport.fail_reads.store(true, Ordering::SeqCst);
    let mut buf = vec![0u8; 300];
    unsafe { b.ep.recv(&mut buf, None, Addr::UNSPEC, Context(3)).unwrap() };
    let payload = vec![1u8; 300];
    unsafe { a.ep.send(&payload, None, b.addr(), Context(4)).unwrap() };
    assert!(c.progress().is_empty());

    let rx = b.rx_cq.drain();
    assert_eq!(rx.len(), 1);
    assert!(matches!(rx[0].status, rxm_api::net::CompletionStatus::Error(_)));
    assert_eq!(rx[0].context, Context(3));
    // the sender is released regardless
    assert_eq!(a.ep.tx_in_flight(), 0);
    assert_eq!(b.ep.posted_len(QueueKind::Msg), 0);
}
