mod common;

use std::sync::Arc;

use rxm::{MsgOps, QueueKind, TaggedOps};
use rxm_api::net::{BindFlags, Caps, CompletionFlags, CompletionStatus};
use rxm_api::{Addr, Context, Error};

use common::*;

#[test]
fn tagged_receive_masks_ignored_bits() {
    let c = Cluster::new(2, small_attr());
    let (a, b) = (&c.peers[0], &c.peers[1]);

    let mut buf = [0u8; 8];
    unsafe {
        b.ep
            .trecv(&mut buf, None, Addr::UNSPEC, 0b1010, 0b0010, Context(1))
            .unwrap()
    };
    a.ep.tinject(b"no", b.addr(), 0b1011).unwrap();
    a.ep.tinject(b"yes", b.addr(), 0b1000).unwrap();
    assert!(c.progress().is_empty());

    let comps = b.rx_cq.drain();
    assert_eq!(comps.len(), 1);
    assert_eq!(comps[0].context, Context(1));
    assert_eq!(comps[0].tag, 0b1000);
    assert_eq!(comps[0].len, 3);
    assert_eq!(comps[0].flags, CompletionFlags::RECV | CompletionFlags::TAGGED);
    assert_eq!(&buf[..3], b"yes");
    assert_eq!(b.ep.unexpected_len(QueueKind::Tagged), 1);
}

#[test]
fn tagged_and_untagged_never_cross_match() {
    let c = Cluster::new(2, small_attr());
    let (a, b) = (&c.peers[0], &c.peers[1]);

    let mut buf = [0u8; 8];
    unsafe { b.ep.recv(&mut buf, None, Addr::UNSPEC, Context(1)).unwrap() };
    a.ep.tinject(b"tagged", b.addr(), 0).unwrap();
    assert!(c.progress().is_empty());
    assert!(b.rx_cq.drain().is_empty());
    assert_eq!(b.ep.posted_len(QueueKind::Msg), 1);
    assert_eq!(b.ep.unexpected_len(QueueKind::Tagged), 1);
}

#[test]
fn first_unexpected_message_wins() {
    let c = Cluster::new(3, small_attr());
    let (a, b, dst) = (&c.peers[0], &c.peers[1], &c.peers[2]);

    a.ep.inject(b"from a", dst.addr()).unwrap();
    b.ep.inject(b"from b", dst.addr()).unwrap();
    assert!(c.progress().is_empty());
    assert_eq!(dst.ep.unexpected_len(QueueKind::Msg), 2);

    let mut first = [0u8; 16];
    let mut second = [0u8; 16];
    unsafe {
        dst.ep.recv(&mut first, None, Addr::UNSPEC, Context(1)).unwrap();
        dst.ep.recv(&mut second, None, Addr::UNSPEC, Context(2)).unwrap();
    }
    assert_eq!(&first[..6], b"from a");
    assert_eq!(&second[..6], b"from b");
    let comps = dst.rx_cq.drain();
    assert_eq!(
        comps.iter().map(|e| e.context).collect::<Vec<_>>(),
        vec![Context(1), Context(2)]
    );
}

#[test]
fn source_filter_needs_directed_recv() {
    for (caps, expect) in [
        (Caps::MSG, &b"from a"[..]),
        (Caps::MSG | Caps::DIRECTED_RECV, &b"from b"[..]),
    ] {
        let c = Cluster::new(
            3,
            rxm::config::EndpointAttr {
                caps,
                ..small_attr()
            },
        );
        let (a, b, dst) = (&c.peers[0], &c.peers[1], &c.peers[2]);
        a.ep.inject(b"from a", dst.addr()).unwrap();
        b.ep.inject(b"from b", dst.addr()).unwrap();
        assert!(c.progress().is_empty());

        let mut buf = [0u8; 16];
        unsafe { dst.ep.recv(&mut buf, None, b.addr(), Context(1)).unwrap() };
        assert_eq!(&buf[..6], expect);
        assert_eq!(dst.ep.unexpected_len(QueueKind::Msg), 1);
    }
}

#[test]
fn posted_receives_match_in_order() {
    let c = Cluster::new(2, small_attr());
    let (a, b) = (&c.peers[0], &c.peers[1]);

    let mut bufs = [[0u8; 8]; 3];
    for (i, buf) in bufs.iter_mut().enumerate() {
        unsafe {
            b.ep
                .trecv(buf, None, Addr::UNSPEC, 7, 0, Context(i as u64))
                .unwrap()
        };
    }
    for msg in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        a.ep.tinject(msg, b.addr(), 7).unwrap();
    }
    assert!(c.progress().is_empty());
    let comps = b.rx_cq.drain();
    assert_eq!(
        comps.iter().map(|e| e.context.0).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(&bufs[2][..5], b"three");
}

#[test]
fn exhausted_descriptors_leave_queues_untouched() {
    let attr = rxm::config::EndpointAttr {
        caps: Caps::MSG | Caps::DIRECTED_RECV,
        ..small_attr()
    };
    let c = Cluster::new(2, attr);
    let (a, b) = (&c.peers[0], &c.peers[1]);

    a.ep.inject(b"pending", b.addr()).unwrap();
    assert!(c.progress().is_empty());

    let mut bufs = vec![[0u8; 4]; 17];
    for buf in bufs.iter_mut().take(16) {
        unsafe { b.ep.recv(buf, None, Addr(5), Context(0)).unwrap() };
    }
    let before = (
        b.ep.posted_len(QueueKind::Msg),
        b.ep.unexpected_len(QueueKind::Msg),
    );
    assert_eq!(before, (16, 1));
    let res = unsafe { b.ep.recv(&mut bufs[16], None, Addr::UNSPEC, Context(0)) };
    assert_eq!(res, Err(Error::ResourceExhausted));
    assert!(res.unwrap_err().is_retryable());
    assert_eq!(
        (
            b.ep.posted_len(QueueKind::Msg),
            b.ep.unexpected_len(QueueKind::Msg)
        ),
        before
    );
}

#[test]
fn full_receive_sink_refuses_immediate_match() {
    let net = Network::new(2);
    let factory = rxm::FabricFactory::new();
    let fabric = factory.open(&fabric_attr()).unwrap();
    let (a, _ta) = open(&fabric, &net, 0, small_attr(), false);
    let (b, _tb) = open(&fabric, &net, 1, small_attr(), false);
    bind_and_enable(&a, 0, 2);
    let tx_cq = TestCq::new(16);
    let rx_cq = TestCq::new(1);
    b.bind_cq(tx_cq, BindFlags::TRANSMIT).unwrap();
    b.bind_cq(rx_cq.clone(), BindFlags::RECV).unwrap();
    b.bind_av(Arc::new(StaticAv::new(1, 2))).unwrap();
    b.enable().unwrap();

    a.inject(b"one", Addr(1)).unwrap();
    a.inject(b"two", Addr(1)).unwrap();
    while let Some(wc) = net.pop_completion(1) {
        b.handle_completion(wc).unwrap();
    }
    assert_eq!(b.unexpected_len(QueueKind::Msg), 2);

    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    unsafe { b.recv(&mut first, None, Addr::UNSPEC, Context(1)).unwrap() };
    assert_eq!(rx_cq.len(), 1);
    let res = unsafe { b.recv(&mut second, None, Addr::UNSPEC, Context(2)) };
    assert_eq!(res, Err(Error::ResourceExhausted));
    assert_eq!(b.unexpected_len(QueueKind::Msg), 1);
    assert_eq!(b.posted_len(QueueKind::Msg), 0);

    rx_cq.drain();
    unsafe { b.recv(&mut second, None, Addr::UNSPEC, Context(2)).unwrap() };
    assert_eq!(&second[..3], b"two");
}

#[test]
fn short_buffer_truncates() {
    let c = Cluster::new(2, small_attr());
    let (a, b) = (&c.peers[0], &c.peers[1]);

    let mut buf = [0u8; 4];
    unsafe { b.ep.recv(&mut buf, None, Addr::UNSPEC, Context(9)).unwrap() };
    a.ep.inject(b"truncated", b.addr()).unwrap();
    assert!(c.progress().is_empty());
    let comps = b.rx_cq.drain();
    assert_eq!(comps.len(), 1);
    assert_eq!(comps[0].status, CompletionStatus::Truncated { overflow: 5 });
    assert_eq!(comps[0].len, 4);
    assert!(!comps[0].is_ok());
    assert_eq!(&buf, b"trun");
}
