//! The fabric context endpoints are opened under.
//!
//! At most one fabric is live at a time. [`FabricFactory::open`] hands out
//! the live instance while any reference to it exists and builds a fresh one
//! otherwise. The optional name service answers peers asking for this
//! process's address and is shut down when the last reference drops.
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use rxm_api::{Addr, Error};

use crate::config::{EndpointAttr, FabricConfig};
use crate::endpoint::Endpoint;
use crate::transport::MsgTransport;

const ACCEPT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricAttr {
    pub name: String,
    /// Start the name service on this address.
    pub name_service: Option<SocketAddr>,
    /// The address the name service reports.
    pub local_addr: Addr,
}

impl FabricAttr {
    pub fn from_config(config: &FabricConfig, local_addr: Addr) -> Self {
        FabricAttr {
            name: config.name.clone(),
            name_service: config.name_service,
            local_addr,
        }
    }
}

struct NameService {
    local: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NameService {
    fn start(bind: SocketAddr, addr: Addr) -> io::Result<Self> {
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("rxm-name-service".to_owned())
            .spawn(move || serve(listener, addr, &stop2))?;
        info!(%local, "name service started");
        Ok(NameService {
            local,
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for NameService {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("name service thread panicked");
            }
        }
        debug!(local = %self.local, "name service stopped");
    }
}

fn serve(listener: TcpListener, addr: Addr, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                debug!(%peer, "name query");
                if let Err(e) = stream.write_all(&addr.0.to_le_bytes()) {
                    warn!(%e, %peer, "failed to answer name query");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(%e, "name service accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Asks the name service at `server` for its fabric's address.
pub fn query_name(server: SocketAddr) -> io::Result<Addr> {
    let mut stream = TcpStream::connect(server)?;
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf)?;
    Ok(Addr(u64::from_le_bytes(buf)))
}

pub struct Fabric {
    name: String,
    name_service: Option<NameService>,
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("name", &self.name)
            .field("name_service", &self.name_service_addr())
            .finish()
    }
}

impl Fabric {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address the name service actually listens on.
    #[inline]
    pub fn name_service_addr(&self) -> Option<SocketAddr> {
        self.name_service.as_ref().map(|ns| ns.local)
    }

    /// Opens an endpoint over `transport`.
    pub fn endpoint(
        self: &Arc<Self>,
        attr: EndpointAttr,
        transport: Arc<dyn MsgTransport>,
    ) -> Result<Endpoint, Error> {
        Endpoint::new(Arc::clone(self), attr, transport)
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        debug!(name = %self.name, "fabric closed");
    }
}

#[derive(Default)]
pub struct FabricFactory {
    active: spin::Mutex<Weak<Fabric>>,
}

impl FabricFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live fabric, or opens one. Fails with `NoData` if the live
    /// fabric has a different name.
    pub fn open(&self, attr: &FabricAttr) -> Result<Arc<Fabric>, Error> {
        let mut active = self.active.lock();
        if let Some(fabric) = active.upgrade() {
            if fabric.name != attr.name {
                return Err(Error::NoData(attr.name.clone()));
            }
            debug!(name = %attr.name, refcnt = Arc::strong_count(&fabric), "fabric reused");
            return Ok(fabric);
        }

        // A failed name service leaves the fabric usable without it.
        let name_service = match attr.name_service {
            Some(bind) => match NameService::start(bind, attr.local_addr) {
                Ok(ns) => Some(ns),
                Err(e) => {
                    warn!(%e, %bind, "name service not started");
                    None
                }
            },
            None => None,
        };
        let fabric = Arc::new(Fabric {
            name: attr.name.clone(),
            name_service,
        });
        *active = Arc::downgrade(&fabric);
        info!(name = %attr.name, "fabric opened");
        Ok(fabric)
    }

    /// References held on the live fabric, zero if none is live.
    pub fn refcount(&self) -> usize {
        self.active.lock().strong_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(name: &str) -> FabricAttr {
        FabricAttr {
            name: name.to_owned(),
            name_service: None,
            local_addr: Addr(1),
        }
    }

    #[test]
    fn single_live_instance() {
        let factory = FabricFactory::new();
        let a = factory.open(&attr("rxm")).unwrap();
        let b = factory.open(&attr("rxm")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.refcount(), 2);
        assert_eq!(factory.open(&attr("other")).unwrap_err(), Error::NoData("other".to_owned()));
        drop(a);
        drop(b);
        assert_eq!(factory.refcount(), 0);
        let c = factory.open(&attr("other")).unwrap();
        assert_eq!(c.name(), "other");
    }

    #[test]
    fn name_service_answers_and_stops() {
        let factory = FabricFactory::new();
        let fabric = factory
            .open(&FabricAttr {
                name: "rxm".to_owned(),
                name_service: Some("127.0.0.1:0".parse().unwrap()),
                local_addr: Addr(0xabcd),
            })
            .unwrap();
        let server = fabric.name_service_addr().unwrap();
        assert_eq!(query_name(server).unwrap(), Addr(0xabcd));
        drop(fabric);
        assert!(query_name(server).is_err());
    }
}
