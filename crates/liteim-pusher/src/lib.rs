//! LiteIM Pusher Library
//!
//! Lifecycle and service-discovery core of a LiteIM pusher node: resolve
//! the node's address, register it under the push role, track the gateway
//! role, serve the push RPC and shut all of it down in order.

pub mod config;
pub mod discovery;
pub mod identity;
pub mod lifecycle;
pub mod observability;
pub mod registration;
pub mod registry;
pub mod rpc;
pub mod version;

pub use config::{PusherConfig, RegistryBackend};
pub use lifecycle::{LifecycleState, Pusher, ShutdownReport, StartupError};
