//! Loopback tunnel
//!
//! Owns one relay connection and a loopback TCP listener. Each accepted
//! local socket is policy-checked, paired with one logical relay stream,
//! and pumped in both directions until either side ends. Session
//! failures stay session-local; only `close()` (or the broker reacting
//! to connection loss) tears the tunnel down.

use crate::error::{TunnelError, TunnelResult};
use crate::policy::{ConnectionDescriptor, RelayPolicy};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vmrelay_proto::Target;
use vmrelay_transport::{
    RelayConnection, RelayConnector, RelayStreamReceiver, RelayStreamSender, TransportError,
};

/// Where local clients should connect to reach the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for TunnelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Tunnel lifecycle, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    Connecting,
    Listening,
    Closing,
    Closed,
}

/// How long `close()` waits for in-flight sessions to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Window for the initial liveness probe to confirm the first stream.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

type ProbeGate = Arc<Mutex<Option<oneshot::Sender<Result<(), TransportError>>>>>;

/// An established tunnel: loopback listener bound, relay connection
/// authenticated, destination confirmed reachable by the initial probe.
pub struct Tunnel {
    target: Target,
    connection: RelayConnection,
    local_port: u16,
    state_tx: watch::Sender<TunnelState>,
    shutdown_tx: watch::Sender<bool>,
    sessions: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    accept_task: JoinHandle<()>,
    closing: AtomicBool,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("target", &self.target)
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    /// Dial the relay, bind the loopback listener, and verify the
    /// destination with one probe session before returning.
    pub async fn open(
        connector: &RelayConnector,
        target: Target,
        bearer_token: &str,
        policy: Arc<dyn RelayPolicy>,
    ) -> TunnelResult<Self> {
        let (state_tx, _) = watch::channel(TunnelState::Created);

        state_tx.send_replace(TunnelState::Connecting);
        let connection = connector.open(&target, bearer_token).await?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| TunnelError::Bind(e.to_string()))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| TunnelError::Bind(e.to_string()))?
            .port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sessions = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());
        let probe_gate: ProbeGate = Arc::new(Mutex::new(None));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            connection.clone(),
            policy,
            sessions.clone(),
            drained.clone(),
            probe_gate.clone(),
            shutdown_rx,
        ));

        state_tx.send_replace(TunnelState::Listening);
        info!("Tunnel for {} listening on 127.0.0.1:{}", target, local_port);

        let tunnel = Self {
            target,
            connection,
            local_port,
            state_tx,
            shutdown_tx,
            sessions,
            drained,
            accept_task,
            closing: AtomicBool::new(false),
        };

        if let Err(e) = tunnel.run_probe(&probe_gate).await {
            warn!("Initial probe for {} failed: {}", tunnel.target, e);
            tunnel.close().await;
            return Err(e);
        }

        Ok(tunnel)
    }

    /// One synthetic loopback connect through the full accept path; its
    /// stream-open result tells us whether the destination is reachable.
    async fn run_probe(&self, gate: &ProbeGate) -> TunnelResult<()> {
        let (gate_tx, gate_rx) = oneshot::channel();
        *gate.lock().unwrap() = Some(gate_tx);

        let probe_socket = TcpStream::connect(("127.0.0.1", self.local_port))
            .await
            .map_err(|e| TunnelError::Bind(e.to_string()))?;

        let outcome = tokio::time::timeout(PROBE_TIMEOUT, gate_rx).await;
        drop(probe_socket);

        match outcome {
            Ok(Ok(Ok(()))) => {
                debug!("Probe confirmed destination for {}", self.target);
                Ok(())
            }
            // The relay could be reached but the destination could not.
            Ok(Ok(Err(e))) => Err(TunnelError::Transport(TransportError::NetworkUnreachable(
                e.to_string(),
            ))),
            Ok(Err(_)) | Err(_) => Err(TunnelError::Transport(
                TransportError::NetworkUnreachable("Probe produced no result".to_string()),
            )),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn endpoint(&self) -> TunnelEndpoint {
        TunnelEndpoint {
            host: "localhost".to_string(),
            port: self.local_port,
        }
    }

    pub fn state(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Resolves once the underlying relay connection is gone.
    pub fn transport_closed(&self) -> watch::Receiver<Option<TransportError>> {
        self.connection.closed()
    }

    /// Whether new local connections can still be served.
    pub fn is_usable(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && self.connection.is_connected()
    }

    /// Tear the tunnel down: stop accepting, drain sessions (bounded),
    /// release the relay connection. Exactly once; later calls no-op.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state_tx.send_replace(TunnelState::Closing);
        let _ = self.shutdown_tx.send(true);

        let drain = async {
            loop {
                // Arm the notification before checking, so a session
                // ending in between is not missed.
                let notified = self.drained.notified();
                if self.sessions.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!(
                "Closing tunnel for {} with {} sessions still active",
                self.target,
                self.sessions.load(Ordering::SeqCst)
            );
        }

        self.accept_task.abort();
        self.connection.close();
        self.state_tx.send_replace(TunnelState::Closed);
        info!("Tunnel for {} closed", self.target);
    }
}

async fn accept_loop(
    listener: TcpListener,
    connection: RelayConnection,
    policy: Arc<dyn RelayPolicy>,
    sessions: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    probe_gate: ProbeGate,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let (socket, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                }
            },
            _ = shutdown_rx.changed() => {
                debug!("Accept loop shutting down");
                return;
            }
        };

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Dropping connection without local address: {}", e);
                continue;
            }
        };
        let descriptor = ConnectionDescriptor {
            peer_addr,
            local_addr,
        };
        if !policy.is_connection_allowed(&descriptor) {
            warn!("Policy rejected local connection from {}", peer_addr);
            continue;
        }

        sessions.fetch_add(1, Ordering::SeqCst);
        let connection = connection.clone();
        let sessions = sessions.clone();
        let drained = drained.clone();
        let probe_gate = probe_gate.clone();
        let session_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let _guard = scopeguard::guard((), move |_| {
                sessions.fetch_sub(1, Ordering::SeqCst);
                drained.notify_waiters();
            });
            run_session(socket, peer_addr, connection, probe_gate, session_shutdown).await;
        });
    }
}

async fn run_session(
    socket: TcpStream,
    peer_addr: std::net::SocketAddr,
    connection: RelayConnection,
    probe_gate: ProbeGate,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let stream = connection.open_stream().await;

    // The first session after startup doubles as the liveness probe.
    if let Some(gate) = probe_gate.lock().unwrap().take() {
        let _ = gate.send(match &stream {
            Ok(_) => Ok(()),
            Err(e) => Err(e.clone()),
        });
    }

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Could not open relay stream for {}: {}", peer_addr, e);
            return;
        }
    };

    let stream_id = stream.stream_id();
    debug!("Session {} started for {}", stream_id, peer_addr);

    let (relay_tx, relay_rx) = stream.split();
    let (local_rx, local_tx) = socket.into_split();

    let mut upstream = tokio::spawn(pump_local_to_relay(local_rx, relay_tx));
    let mut downstream = tokio::spawn(pump_relay_to_local(relay_rx, local_tx));

    // Either direction ending ends the session; the other pump is
    // stopped so neither socket lingers half-open. Tunnel shutdown ends
    // sessions that would otherwise outlive the listener.
    tokio::select! {
        _ = &mut upstream => downstream.abort(),
        _ = &mut downstream => upstream.abort(),
        _ = shutdown_rx.changed() => {
            upstream.abort();
            downstream.abort();
        }
    }

    debug!("Session {} ended for {}", stream_id, peer_addr);
}

async fn pump_local_to_relay(mut local_rx: OwnedReadHalf, mut relay_tx: RelayStreamSender) {
    let mut buf = [0u8; 8192];
    loop {
        match local_rx.read(&mut buf).await {
            Ok(0) => {
                let _ = relay_tx.finish().await;
                return;
            }
            Ok(n) => {
                if relay_tx.send(&buf[..n]).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Local read ended: {}", e);
                let _ = relay_tx.reset().await;
                return;
            }
        }
    }
}

async fn pump_relay_to_local(mut relay_rx: RelayStreamReceiver, mut local_tx: OwnedWriteHalf) {
    while let Some(chunk) = relay_rx.recv().await {
        if let Err(e) = local_tx.write_all(&chunk).await {
            debug!("Local write ended: {}", e);
            return;
        }
    }
    let _ = local_tx.shutdown().await;
}
