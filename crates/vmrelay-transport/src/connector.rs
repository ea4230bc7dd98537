//! Relay dialer and handshake
//!
//! Establishes the transport (TCP, optionally TLS), then authenticates
//! with a `ClientHello`/`ServerHello` exchange. TCP connect, TLS, and the
//! hello exchange all share one handshake window; a peer that closes the
//! socket mid-handshake is classified the same as one that never answers.

use crate::config::RelayClientConfig;
use crate::connection::{control_frame, read_frame, write_frame, RelayConnection, RelayIo};
use crate::error::{TransportError, TransportResult};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, info};
use vmrelay_proto::{FrameType, RefusalReason, RelayMessage, Target, PROTOCOL_VERSION};

/// Dials the relay endpoint and performs the authentication handshake.
pub struct RelayConnector {
    config: RelayClientConfig,
}

impl RelayConnector {
    pub fn new(config: RelayClientConfig) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RelayClientConfig {
        &self.config
    }

    /// Open an authenticated connection scoped to `target`.
    ///
    /// The whole sequence is bounded by the configured handshake timeout.
    pub async fn open(
        &self,
        target: &Target,
        bearer_token: &str,
    ) -> TransportResult<RelayConnection> {
        let (hostname, addr) = resolve_endpoint(&self.config.endpoint).await?;

        let handshake = self.connect_and_handshake(&hostname, addr, target, bearer_token);
        match tokio::time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::HandshakeTimeout),
        }
    }

    async fn connect_and_handshake(
        &self,
        hostname: &str,
        addr: SocketAddr,
        target: &Target,
        bearer_token: &str,
    ) -> TransportResult<RelayConnection> {
        debug!("Connecting to relay at {} ({})", self.config.endpoint, addr);

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::NetworkUnreachable(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let mut io: Box<dyn RelayIo> = match self.config.build_tls_connector()? {
            Some(connector) => {
                let sni = self.config.sni_name(hostname);
                let server_name = rustls::pki_types::ServerName::try_from(sni)
                    .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| TransportError::TlsError(e.to_string()))?;
                Box::new(tls)
            }
            None => Box::new(tcp),
        };

        let hello = control_frame(&RelayMessage::ClientHello {
            version: PROTOCOL_VERSION,
            target: target.clone(),
            bearer_token: bearer_token.to_string(),
        })?;
        write_frame(&mut io, &hello).await?;

        let reply = match read_frame(&mut io).await? {
            Some(frame) => frame,
            // Peer hung up instead of answering the hello.
            None => return Err(TransportError::HandshakeTimeout),
        };
        if reply.frame_type != FrameType::Control {
            return Err(TransportError::ProtocolViolation(format!(
                "Expected control frame during handshake, got {:?}",
                reply.frame_type
            )));
        }

        let message = RelayMessage::decode(&reply.payload)
            .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
        match message {
            RelayMessage::ServerHello { session_id } => {
                info!("Relay session {} established for {}", session_id, target);
                Ok(RelayConnection::start(
                    io,
                    session_id,
                    self.config.stream_open_timeout,
                ))
            }
            RelayMessage::Refused { reason } => Err(match reason {
                RefusalReason::InvalidCredential => TransportError::CredentialRejected,
                RefusalReason::AccessDenied => TransportError::AccessDenied,
                RefusalReason::Unavailable(detail) => TransportError::ConnectionFailed(detail),
            }),
            other => Err(TransportError::ProtocolViolation(format!(
                "Unexpected handshake reply: {:?}",
                other
            ))),
        }
    }
}

/// Resolve `host:port` (optionally prefixed with `relay://`) to a socket
/// address, preferring IPv4 when both families resolve.
async fn resolve_endpoint(endpoint: &str) -> TransportResult<(String, SocketAddr)> {
    let trimmed = endpoint
        .strip_prefix("relay://")
        .or_else(|| endpoint.strip_prefix("tcp://"))
        .unwrap_or(endpoint);

    let (host, port) = match trimmed.rfind(':') {
        Some(idx) => {
            let port = trimmed[idx + 1..].parse::<u16>().map_err(|_| {
                TransportError::ConfigurationError(format!("Invalid relay port in '{}'", endpoint))
            })?;
            (trimmed[..idx].to_string(), port)
        }
        None => {
            return Err(TransportError::ConfigurationError(format!(
                "Relay endpoint '{}' is missing a port",
                endpoint
            )))
        }
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| TransportError::NetworkUnreachable(e.to_string()))?
        .collect();

    let addr = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            TransportError::NetworkUnreachable(format!("No addresses for '{}'", host))
        })?;

    Ok((host, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_strips_scheme() {
        let (host, addr) = resolve_endpoint("relay://127.0.0.1:9443").await.unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(addr.port(), 9443);
    }

    #[tokio::test]
    async fn test_resolve_missing_port() {
        let err = resolve_endpoint("relay.example.com").await.unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_resolve_bad_port() {
        let err = resolve_endpoint("relay.example.com:http").await.unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
    }
}
