use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use rxm_api::net::Caps;
use rxm_api::{Error, IOV_LIMIT};

use crate::packet::PKT_HDR_LEN;

/// Inline capacity of an eager frame when the buffers are 16 KiB.
pub const DEFAULT_EAGER_THRESHOLD: usize = 16384 - PKT_HDR_LEN;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    #[serde(default)]
    pub fabric: FabricConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_owned(),
            fabric: FabricConfig::default(),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        content.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config = toml::from_str(s)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FabricConfig {
    pub name: String,
    /// Where the name service listens, if it is started at all.
    pub name_service: Option<SocketAddr>,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            name: "rxm".to_owned(),
            name_service: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EndpointConfig {
    pub tx_size: usize,
    pub rx_size: usize,
    pub eager_threshold: usize,
    pub max_iov: usize,
    /// Any of "msg", "tagged" and "directed_recv".
    pub caps: Vec<String>,
    pub directed_recv: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            tx_size: 256,
            rx_size: 256,
            eager_threshold: DEFAULT_EAGER_THRESHOLD,
            max_iov: IOV_LIMIT,
            caps: vec!["msg".to_owned(), "tagged".to_owned()],
            directed_recv: false,
        }
    }
}

impl EndpointConfig {
    pub fn attr(&self) -> Result<EndpointAttr, Error> {
        let mut caps = Caps::empty();
        for name in &self.caps {
            caps |= match name.as_str() {
                "msg" => Caps::MSG,
                "tagged" => Caps::TAGGED,
                "directed_recv" => Caps::DIRECTED_RECV,
                other => {
                    return Err(Error::InvalidArgument(format!("unknown capability {other}")))
                }
            };
        }
        if self.directed_recv {
            caps |= Caps::DIRECTED_RECV;
        }
        let attr = EndpointAttr {
            caps,
            tx_size: self.tx_size,
            rx_size: self.rx_size,
            eager_threshold: self.eager_threshold,
            max_iov: self.max_iov,
        };
        attr.validate()?;
        Ok(attr)
    }
}

/// Sizing and capabilities of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointAttr {
    pub caps: Caps,
    /// Outbound operations in flight, and the size of the send buffer pool.
    pub tx_size: usize,
    /// Receive descriptors per queue, and the number of receive buffers.
    pub rx_size: usize,
    /// Largest payload sent inline.
    pub eager_threshold: usize,
    /// Largest segment count of one operation.
    pub max_iov: usize,
}

impl Default for EndpointAttr {
    fn default() -> Self {
        EndpointAttr {
            caps: Caps::MSG | Caps::TAGGED,
            tx_size: 256,
            rx_size: 256,
            eager_threshold: DEFAULT_EAGER_THRESHOLD,
            max_iov: IOV_LIMIT,
        }
    }
}

impl EndpointAttr {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_iov == 0 || self.max_iov > IOV_LIMIT {
            return Err(Error::InvalidArgument(format!(
                "max_iov must be within 1..={}, got {}",
                IOV_LIMIT, self.max_iov
            )));
        }
        if self.tx_size == 0 || self.rx_size == 0 {
            return Err(Error::InvalidArgument(
                "tx_size and rx_size must be non-zero".to_owned(),
            ));
        }
        if !self.caps.intersects(Caps::MSG | Caps::TAGGED) {
            return Err(Error::InvalidArgument(
                "endpoint needs msg or tagged capability".to_owned(),
            ));
        }
        Ok(())
    }
}
