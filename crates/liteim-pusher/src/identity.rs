//! Node Identity Resolution
//!
//! Determines the address this node advertises to the rest of the cluster:
//! the first non-loopback IPv4 interface address, paired with the RPC port.
//!
//! Interface enumeration order is whatever the OS reports, so two runs on
//! the same host may pick different addresses when interfaces change. Set
//! `stable_identity` to pick the lexicographically smallest candidate
//! instead.

use liteim_core::NodeAddress;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no non-loopback IPv4 interface address found")]
    NoInterfaceFound,
    #[error("failed to enumerate network interfaces: {0}")]
    Enumeration(String),
    #[error("advertised address {0} is a loopback address")]
    LoopbackOverride(Ipv4Addr),
}

/// Source of `(interface name, address)` pairs
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self) -> Result<Vec<(String, IpAddr)>, IdentityError>;
}

/// Enumerates the host's interfaces
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> Result<Vec<(String, IpAddr)>, IdentityError> {
        local_ip_address::list_afinet_netifas()
            .map_err(|e| IdentityError::Enumeration(e.to_string()))
    }
}

/// Fixed interface list
#[derive(Debug, Default, Clone)]
pub struct StaticInterfaces(pub Vec<(String, IpAddr)>);

impl InterfaceSource for StaticInterfaces {
    fn interfaces(&self) -> Result<Vec<(String, IpAddr)>, IdentityError> {
        Ok(self.0.clone())
    }
}

/// Resolves the node's advertised address
pub struct IdentityResolver<'a> {
    source: &'a dyn InterfaceSource,
    advertise_ip: Option<Ipv4Addr>,
    stable: bool,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(source: &'a dyn InterfaceSource) -> Self {
        Self {
            source,
            advertise_ip: None,
            stable: false,
        }
    }

    /// Use an explicit address instead of enumerating interfaces
    pub fn with_advertise_ip(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.advertise_ip = ip;
        self
    }

    /// Pick the smallest `(interface, address)` candidate instead of the first
    pub fn with_stable_order(mut self, stable: bool) -> Self {
        self.stable = stable;
        self
    }

    pub fn resolve(&self, port: u16) -> Result<NodeAddress, IdentityError> {
        if let Some(ip) = self.advertise_ip {
            if ip.is_loopback() {
                return Err(IdentityError::LoopbackOverride(ip));
            }
            info!(address = %ip, port = port, "Using configured advertise address");
            return Ok(NodeAddress::new(ip, port));
        }

        let mut candidates: Vec<(String, Ipv4Addr)> = self
            .source
            .interfaces()?
            .into_iter()
            .filter_map(|(name, ip)| match ip {
                IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some((name, v4)),
                _ => None,
            })
            .collect();

        debug!(candidates = ?candidates, "Interface candidates");

        if self.stable {
            candidates.sort();
        }

        let (interface, host) = candidates
            .into_iter()
            .next()
            .ok_or(IdentityError::NoInterfaceFound)?;

        let address = NodeAddress::new(host, port);
        info!(interface = %interface, address = %address, "Resolved node identity");
        Ok(address)
    }
}
