//! Registry key layout.
//!
//! Every registered node lives at `/liteim/services/{role}/{host:port}`.
//! Watching the role prefix yields the membership of that role.

use crate::{NodeAddress, ServiceRole};

pub const SERVICES_PREFIX: &str = "/liteim/services/";

/// Prefix under which all members of `role` are stored
pub fn role_prefix(role: &ServiceRole) -> String {
    format!("{}{}/", SERVICES_PREFIX, role)
}

/// Key of a single member
pub fn member_key(role: &ServiceRole, address: &NodeAddress) -> String {
    format!("{}{}", role_prefix(role), address)
}

/// Extract the member address from a key under `prefix`.
///
/// Returns `None` for keys outside the prefix or with a malformed suffix.
pub fn address_from_key(prefix: &str, key: &str) -> Option<NodeAddress> {
    key.strip_prefix(prefix)?.parse().ok()
}
