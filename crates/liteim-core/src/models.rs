//! Service-discovery models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// A reachable `(host, port)` endpoint of a node.
///
/// Ordered by host then port so that sets of addresses iterate in a
/// stable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeAddress {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: Ipv4Addr, port: u16) -> Self {
        Self { host, port }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid node address '{input}': {reason}")]
pub struct AddressParseError {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for NodeAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| AddressParseError {
            input: s.to_string(),
            reason,
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(|| err("missing port"))?;
        let host = host
            .parse::<Ipv4Addr>()
            .map_err(|_| err("host is not an IPv4 address"))?;
        let port = port.parse::<u16>().map_err(|_| err("invalid port"))?;

        Ok(Self { host, port })
    }
}

impl Serialize for NodeAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logical service name under which nodes register and are discovered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceRole(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("service role name must not be empty or contain '/'")]
pub struct InvalidRole;

impl ServiceRole {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidRole> {
        let name = name.into().trim().to_string();
        if name.is_empty() || name.contains('/') {
            return Err(InvalidRole);
        }
        Ok(Self(name))
    }

    /// Default role name of pusher nodes
    pub fn push_service() -> Self {
        Self("push-service".to_string())
    }

    /// Default role name of gateway nodes
    pub fn gateway_service() -> Self {
        Self("gateway-service".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceRole {
    type Error = InvalidRole;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceRole> for String {
    fn from(role: ServiceRole) -> Self {
        role.0
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A change to the membership of a watched role.
///
/// `FullResync` replaces the whole view and is produced after an initial
/// listing or after a dropped watch, when intervening events may be lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    FullResync(Vec<NodeAddress>),
    Added(NodeAddress),
    Removed(NodeAddress),
}

/// Value stored in the registry for each registered node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub address: NodeAddress,
    pub role: ServiceRole,
    /// Per-process identifier, distinguishes restarts on the same address
    pub instance_id: Uuid,
    pub registered_at: DateTime<Utc>,
    /// Build version of the registering node
    #[serde(default)]
    pub version: String,
}

impl RegistrationRecord {
    pub fn new(role: ServiceRole, address: NodeAddress, version: impl Into<String>) -> Self {
        Self {
            address,
            role,
            instance_id: Uuid::new_v4(),
            registered_at: Utc::now(),
            version: version.into(),
        }
    }
}
