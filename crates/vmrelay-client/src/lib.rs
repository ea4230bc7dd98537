//! Tunnel client: policy, tunnel lifecycle, and the broker registry.
//!
//! The broker is the public entry point: give it a connector and a
//! credential source, then ask it to `connect` targets. Each target gets
//! at most one tunnel, exposed as a loopback TCP listener that ordinary
//! clients (RDP, SSH) connect to.

pub mod broker;
pub mod error;
pub mod policy;
pub mod tunnel;

pub use broker::{
    BrokerConfig, BrokerEvent, CredentialSource, StaticCredential, TunnelBroker,
};
pub use error::{TunnelError, TunnelResult};
pub use policy::{AllowAllRelayPolicy, ConnectionDescriptor, RelayPolicy, SameProcessRelayPolicy};
pub use tunnel::{Tunnel, TunnelEndpoint, TunnelState};
