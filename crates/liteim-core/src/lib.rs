//! Core shared types for LiteIM nodes
//!
//! This crate contains the service-discovery vocabulary shared by every
//! LiteIM node type (pusher, gateway): node addresses, service roles,
//! membership events and the registry key layout.

pub mod keys;
mod models;

pub use models::{
    AddressParseError, InvalidRole, MembershipEvent, NodeAddress, RegistrationRecord, ServiceRole,
};
