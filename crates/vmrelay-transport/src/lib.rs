//! Relay Transport Client
//!
//! Opens one authenticated, encrypted streaming connection to the relay
//! endpoint for a given target and multiplexes logical byte streams over
//! it. The tunnel layer pairs each accepted local socket with one such
//! stream; this crate only moves bytes and classifies failures.

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;

#[cfg(feature = "test-util")]
pub mod test_util;

pub use config::{RelayClientConfig, TransportSecurity};
pub use connection::{RelayConnection, RelayStream, RelayStreamReceiver, RelayStreamSender};
pub use connector::RelayConnector;
pub use error::{TransportError, TransportResult};
