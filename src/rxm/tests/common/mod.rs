//! An in-process network of nodes wired back to back. Sends copy frames into
//! receive buffers the peer posted, reads copy straight out of the peer's
//! memory, and every operation's work completion is queued on the node that
//! posted it until the test feeds it to the endpoint.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rxm::config::EndpointAttr;
use rxm::{
    CompletionSink, ConnHandle, ConnectionResolver, Endpoint, Fabric, FabricAttr, FabricFactory,
    MemoryRegion, MsgTransport, RawBuf, RemoteIov, WcStatus, WorkCompletion,
};
use rxm_api::net::{BindFlags, CompletionEntry};
use rxm_api::{Addr, Error, MemDesc};

#[derive(Default)]
struct Node {
    posted: VecDeque<(RawBuf, u64)>,
    backlog: VecDeque<Vec<u8>>,
    completions: VecDeque<WorkCompletion>,
}

#[derive(Default)]
pub struct Network {
    nodes: Mutex<Vec<Node>>,
    /// Every frame sent, by source node.
    sent: Mutex<Vec<(usize, Vec<u8>)>>,
}

impl Network {
    pub fn new(nodes: usize) -> Arc<Self> {
        let net = Network::default();
        net.nodes.lock().unwrap().resize_with(nodes, Node::default);
        Arc::new(net)
    }

    fn deliver(node: &mut Node, frame: &[u8], buf: RawBuf, wr_id: u64) {
        let n = frame.len().min(buf.len);
        unsafe { std::ptr::copy_nonoverlapping(frame.as_ptr(), buf.ptr, n) };
        node.completions
            .push_back(WorkCompletion::success(wr_id, frame.len() as u32));
    }

    /// Takes every completion queued on `node`.
    pub fn take_completions(&self, node: usize) -> Vec<WorkCompletion> {
        self.nodes.lock().unwrap()[node].completions.drain(..).collect()
    }

    pub fn pop_completion(&self, node: usize) -> Option<WorkCompletion> {
        self.nodes.lock().unwrap()[node].completions.pop_front()
    }

    /// Receive buffers `node` has handed to the network.
    pub fn posted_recvs(&self, node: usize) -> usize {
        self.nodes.lock().unwrap()[node].posted.len()
    }

    pub fn sent_frames(&self) -> Vec<(usize, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

pub struct LoopMr {
    desc: MemDesc,
    live: Arc<AtomicUsize>,
}

impl MemoryRegion for LoopMr {
    fn desc(&self) -> MemDesc {
        self.desc
    }
}

impl Drop for LoopMr {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct LoopTransport {
    net: Arc<Network>,
    node: usize,
    requires_mr: bool,
    pub fail_sends: AtomicBool,
    pub fail_recvs: AtomicBool,
    pub fail_reads: AtomicBool,
    /// Sends to swallow: they are accepted but complete with an error and
    /// never reach the peer.
    pub lose_sends: AtomicUsize,
    pub live_mrs: Arc<AtomicUsize>,
    next_key: AtomicU64,
}

impl LoopTransport {
    pub fn new(net: &Arc<Network>, node: usize, requires_mr: bool) -> Arc<Self> {
        Arc::new(LoopTransport {
            net: Arc::clone(net),
            node,
            requires_mr,
            fail_sends: AtomicBool::new(false),
            fail_recvs: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            lose_sends: AtomicUsize::new(0),
            live_mrs: Arc::new(AtomicUsize::new(0)),
            next_key: AtomicU64::new(1),
        })
    }

    fn injected(flag: &AtomicBool) -> io::Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::Other, "injected failure"))
        } else {
            Ok(())
        }
    }
}

impl MsgTransport for LoopTransport {
    fn requires_local_mr(&self) -> bool {
        self.requires_mr
    }

    unsafe fn register(&self, _region: RawBuf) -> io::Result<Box<dyn MemoryRegion>> {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        self.live_mrs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopMr {
            desc: MemDesc { handle: key, key },
            live: Arc::clone(&self.live_mrs),
        }))
    }

    unsafe fn post_send(
        &self,
        conn: &ConnHandle,
        buf: RawBuf,
        _desc: Option<MemDesc>,
        wr_id: u64,
    ) -> io::Result<()> {
        Self::injected(&self.fail_sends)?;
        let lost = self
            .lose_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            self.net.nodes.lock().unwrap()[self.node]
                .completions
                .push_back(WorkCompletion {
                    wr_id,
                    status: WcStatus::Error(5),
                    byte_len: 0,
                });
            return Ok(());
        }
        let frame = std::slice::from_raw_parts(buf.ptr, buf.len).to_vec();
        self.net.sent.lock().unwrap().push((self.node, frame.clone()));
        let mut nodes = self.net.nodes.lock().unwrap();
        let dest = &mut nodes[conn.id as usize];
        match dest.posted.pop_front() {
            Some((rbuf, rwr)) => Network::deliver(dest, &frame, rbuf, rwr),
            None => dest.backlog.push_back(frame),
        }
        nodes[self.node]
            .completions
            .push_back(WorkCompletion::success(wr_id, 0));
        Ok(())
    }

    unsafe fn post_recv(&self, buf: RawBuf, _desc: Option<MemDesc>, wr_id: u64) -> io::Result<()> {
        Self::injected(&self.fail_recvs)?;
        let mut nodes = self.net.nodes.lock().unwrap();
        let node = &mut nodes[self.node];
        match node.backlog.pop_front() {
            Some(frame) => Network::deliver(node, &frame, buf, wr_id),
            None => node.posted.push_back((buf, wr_id)),
        }
        Ok(())
    }

    unsafe fn post_read(
        &self,
        _conn: &ConnHandle,
        local: RawBuf,
        _desc: Option<MemDesc>,
        remote: RemoteIov,
        wr_id: u64,
    ) -> io::Result<()> {
        Self::injected(&self.fail_reads)?;
        assert_eq!(local.len as u64, remote.len);
        std::ptr::copy_nonoverlapping(remote.addr as *const u8, local.ptr, local.len);
        self.net.nodes.lock().unwrap()[self.node]
            .completions
            .push_back(WorkCompletion::success(wr_id, local.len as u32));
        Ok(())
    }
}

/// Node `n` lives at `Addr(n)`; the connection key a node hands its peers is
/// its own index.
pub struct StaticAv {
    node: usize,
    nodes: usize,
}

impl StaticAv {
    pub fn new(node: usize, nodes: usize) -> Self {
        StaticAv { node, nodes }
    }
}

impl ConnectionResolver for StaticAv {
    fn resolve(&self, addr: Addr) -> Result<ConnHandle, Error> {
        if addr.0 as usize >= self.nodes {
            return Err(Error::Transport(format!("no route to {:?}", addr)));
        }
        Ok(ConnHandle {
            id: addr.0,
            remote_key: self.node as u32,
        })
    }

    fn lookup(&self, conn_id: u32) -> Option<(Addr, ConnHandle)> {
        if conn_id as usize >= self.nodes {
            return None;
        }
        Some((
            Addr(conn_id as u64),
            ConnHandle {
                id: conn_id as u64,
                remote_key: self.node as u32,
            },
        ))
    }
}

pub struct TestCq {
    entries: Mutex<VecDeque<CompletionEntry>>,
    cap: usize,
}

impl TestCq {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(TestCq {
            entries: Mutex::new(VecDeque::new()),
            cap,
        })
    }

    pub fn drain(&self) -> Vec<CompletionEntry> {
        self.entries.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl CompletionSink for TestCq {
    fn is_full(&self) -> bool {
        self.entries.lock().unwrap().len() >= self.cap
    }

    fn write(&self, entry: CompletionEntry) -> Result<(), Error> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.cap {
            return Err(Error::ResourceExhausted);
        }
        entries.push_back(entry);
        Ok(())
    }
}

pub struct Peer {
    pub ep: Endpoint,
    pub transport: Arc<LoopTransport>,
    pub tx_cq: Arc<TestCq>,
    pub rx_cq: Arc<TestCq>,
    pub node: usize,
}

impl Peer {
    pub fn addr(&self) -> Addr {
        Addr(self.node as u64)
    }
}

pub struct Cluster {
    pub net: Arc<Network>,
    pub factory: FabricFactory,
    pub fabric: Arc<Fabric>,
    pub peers: Vec<Peer>,
}

pub fn fabric_attr() -> FabricAttr {
    FabricAttr {
        name: "rxm".to_owned(),
        name_service: None,
        local_addr: Addr(0),
    }
}

pub fn small_attr() -> EndpointAttr {
    EndpointAttr {
        tx_size: 16,
        rx_size: 16,
        eager_threshold: 128,
        ..Default::default()
    }
}

/// Opens an endpoint on `node` without binding anything.
pub fn open(
    fabric: &Arc<Fabric>,
    net: &Arc<Network>,
    node: usize,
    attr: EndpointAttr,
    requires_mr: bool,
) -> (Endpoint, Arc<LoopTransport>) {
    let transport = LoopTransport::new(net, node, requires_mr);
    let ep = fabric
        .endpoint(attr, Arc::clone(&transport) as Arc<dyn MsgTransport>)
        .unwrap();
    (ep, transport)
}

pub fn bind_and_enable(ep: &Endpoint, node: usize, nodes: usize) -> (Arc<TestCq>, Arc<TestCq>) {
    let tx_cq = TestCq::new(1024);
    let rx_cq = TestCq::new(1024);
    ep.bind_cq(tx_cq.clone(), BindFlags::TRANSMIT).unwrap();
    ep.bind_cq(rx_cq.clone(), BindFlags::RECV).unwrap();
    ep.bind_av(Arc::new(StaticAv::new(node, nodes))).unwrap();
    ep.enable().unwrap();
    (tx_cq, rx_cq)
}

impl Cluster {
    pub fn new(nodes: usize, attr: EndpointAttr) -> Self {
        Self::with_mr(nodes, attr, false)
    }

    pub fn with_mr(nodes: usize, attr: EndpointAttr, requires_mr: bool) -> Self {
        let net = Network::new(nodes);
        let factory = FabricFactory::new();
        let fabric = factory.open(&fabric_attr()).unwrap();
        let peers = (0..nodes)
            .map(|node| {
                let (ep, transport) = open(&fabric, &net, node, attr, requires_mr);
                let (tx_cq, rx_cq) = bind_and_enable(&ep, node, nodes);
                Peer {
                    ep,
                    transport,
                    tx_cq,
                    rx_cq,
                    node,
                }
            })
            .collect();
        Cluster {
            net,
            factory,
            fabric,
            peers,
        }
    }

    /// Feeds queued completions to their endpoints until every node is
    /// quiet, returning the errors the endpoints reported.
    pub fn progress(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        loop {
            let mut idle = true;
            for peer in &self.peers {
                while let Some(wc) = self.net.pop_completion(peer.node) {
                    idle = false;
                    if let Err(e) = peer.ep.handle_completion(wc) {
                        errors.push(e);
                    }
                }
            }
            if idle {
                return errors;
            }
        }
    }
}
