//! Tunnel broker
//!
//! Owns every tunnel in the process, keyed by target. Concurrent
//! requests for the same target share one tunnel (and one in-flight
//! dial); reference counts plus a short grace period decide when a
//! tunnel is actually torn down. Collaborators are injected at
//! construction; the broker holds no global state.

use crate::error::{TunnelError, TunnelResult};
use crate::policy::RelayPolicy;
use crate::tunnel::{Tunnel, TunnelEndpoint};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use vmrelay_proto::Target;
use vmrelay_transport::{RelayConnector, TransportError};

/// Supplies the opaque bearer credential presented to the relay.
/// Acquisition and refresh live entirely behind this seam.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn bearer_token(&self, target: &Target) -> TunnelResult<String>;
}

/// A fixed token, for tests and short-lived CLI invocations.
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredential {
    async fn bearer_token(&self, _target: &Target) -> TunnelResult<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bound on one full tunnel establishment (credential + handshake +
    /// probe).
    pub connect_timeout: Duration,
    /// How long an unreferenced tunnel lingers before teardown, so
    /// back-to-back reconnects reuse it.
    pub grace_period: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(2),
        }
    }
}

/// Notifications about tunnels the broker manages.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// The relay connection died underneath a registered tunnel.
    TunnelLost {
        target: Target,
        reason: TransportError,
    },
    /// A tunnel was torn down deliberately (refcount reached zero, or
    /// broker shutdown).
    TunnelClosed { target: Target },
}

struct TunnelEntry {
    tunnel: Arc<Tunnel>,
    refcount: usize,
    /// Generation of the dial that registered this tunnel.
    dial_generation: u64,
}

struct DialEntry {
    /// Distinguishes this dial from any later dial for the same target,
    /// so a timed-out caller can tell which one it was counted on.
    generation: u64,
    /// Callers currently waiting on this dial. The finished dial turns
    /// the surviving waiters into the initial reference count.
    waiters: usize,
    result_tx: broadcast::Sender<TunnelResult<TunnelEndpoint>>,
}

#[derive(Default)]
struct BrokerState {
    tunnels: HashMap<Target, TunnelEntry>,
    dialing: HashMap<Target, DialEntry>,
    next_dial_generation: u64,
    shutting_down: bool,
}

struct BrokerInner {
    connector: RelayConnector,
    credentials: Arc<dyn CredentialSource>,
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    events_tx: broadcast::Sender<BrokerEvent>,
}

/// Shared handle to the tunnel registry. Cheap to clone.
#[derive(Clone)]
pub struct TunnelBroker {
    inner: Arc<BrokerInner>,
}

impl TunnelBroker {
    pub fn new(
        connector: RelayConnector,
        credentials: Arc<dyn CredentialSource>,
        config: BrokerConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(BrokerInner {
                connector,
                credentials,
                config,
                state: Mutex::new(BrokerState::default()),
                events_tx,
            }),
        }
    }

    /// Get a usable local endpoint for `target`, reusing a registered
    /// tunnel or joining an in-flight dial when one exists. `wait`
    /// bounds only this caller; a shared dial keeps running for the
    /// other waiters when one caller gives up.
    pub async fn connect(
        &self,
        target: &Target,
        policy: Arc<dyn RelayPolicy>,
        wait: Duration,
    ) -> TunnelResult<TunnelEndpoint> {
        let (mut result_rx, dial_generation) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutting_down {
                return Err(TunnelError::ShuttingDown);
            }

            let usable = state.tunnels.get(target).map(|e| e.tunnel.is_usable());
            match usable {
                Some(true) => {
                    let entry = state
                        .tunnels
                        .get_mut(target)
                        .ok_or_else(|| TunnelError::TunnelLost("Registry race".to_string()))?;
                    entry.refcount += 1;
                    debug!(
                        "Reusing tunnel for {} (refcount {})",
                        target, entry.refcount
                    );
                    return Ok(entry.tunnel.endpoint());
                }
                Some(false) => {
                    // The transport died but nobody noticed yet; replace it.
                    if let Some(stale) = state.tunnels.remove(target) {
                        tokio::spawn(async move { stale.tunnel.close().await });
                    }
                }
                None => {}
            }

            match state.dialing.get_mut(target) {
                Some(dial) => {
                    dial.waiters += 1;
                    debug!("Joining in-flight dial for {}", target);
                    (dial.result_tx.subscribe(), dial.generation)
                }
                None => {
                    let generation = state.next_dial_generation;
                    state.next_dial_generation += 1;
                    let (result_tx, result_rx) = broadcast::channel(1);
                    state.dialing.insert(
                        target.clone(),
                        DialEntry {
                            generation,
                            waiters: 1,
                            result_tx,
                        },
                    );
                    tokio::spawn(run_dial(self.inner.clone(), target.clone(), policy));
                    (result_rx, generation)
                }
            }
        };

        match tokio::time::timeout(wait, result_rx.recv()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TunnelError::TunnelLost(
                "Dial finished without a result".to_string(),
            )),
            Err(_) => {
                self.abandon_wait(target, dial_generation);
                Err(TunnelError::Timeout)
            }
        }
    }

    /// This caller timed out. If the dial it was counted on is still
    /// running, stop counting them; if that dial finished meanwhile,
    /// they were credited a reference that must be released. The
    /// generation checks keep the decrement off any unrelated later
    /// dial or tunnel for the same target.
    fn abandon_wait(&self, target: &Target, generation: u64) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(dial) = state.dialing.get_mut(target) {
                if dial.generation == generation {
                    dial.waiters = dial.waiters.saturating_sub(1);
                    return;
                }
            }
        }
        self.release(target, Some(generation));
    }

    /// Release one reference to the target's tunnel. Idempotent: extra
    /// calls on an unregistered target or at zero change nothing. The
    /// last reference starts the grace-period teardown.
    pub fn disconnect(&self, target: &Target) {
        self.release(target, None);
    }

    /// When `generation` is given, only a tunnel registered by that
    /// dial is touched.
    fn release(&self, target: &Target, generation: Option<u64>) {
        let teardown = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(entry) = state.tunnels.get_mut(target) else {
                return;
            };
            if let Some(generation) = generation {
                if entry.dial_generation != generation {
                    return;
                }
            }
            if entry.refcount > 0 {
                entry.refcount -= 1;
            }
            debug!("Released tunnel for {} (refcount {})", target, entry.refcount);
            (entry.refcount == 0).then(|| entry.tunnel.clone())
        };

        if let Some(tunnel) = teardown {
            let inner = self.inner.clone();
            let target = target.clone();
            tokio::spawn(async move {
                tokio::time::sleep(inner.config.grace_period).await;
                let removed = {
                    let mut state = inner.state.lock().unwrap();
                    match state.tunnels.get(&target) {
                        // Still the same tunnel and still unreferenced.
                        Some(entry)
                            if entry.refcount == 0 && Arc::ptr_eq(&entry.tunnel, &tunnel) =>
                        {
                            state.tunnels.remove(&target)
                        }
                        _ => None,
                    }
                };
                if let Some(entry) = removed {
                    entry.tunnel.close().await;
                    let _ = inner.events_tx.send(BrokerEvent::TunnelClosed { target });
                }
            });
        }
    }

    /// Look up a usable endpoint for `target` without taking a
    /// reference. `None` when no usable tunnel is registered.
    pub fn try_activate(&self, target: &Target) -> Option<TunnelEndpoint> {
        let state = self.inner.state.lock().unwrap();
        state
            .tunnels
            .get(target)
            .filter(|entry| entry.tunnel.is_usable())
            .map(|entry| entry.tunnel.endpoint())
    }

    /// Subscribe to tunnel lifecycle notifications.
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Close every tunnel and refuse new work. Used on process exit.
    pub async fn shutdown(&self) {
        let tunnels: Vec<(Target, TunnelEntry)> = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutting_down = true;
            state.dialing.clear();
            state.tunnels.drain().collect()
        };

        for (target, entry) in tunnels {
            entry.tunnel.close().await;
            let _ = self
                .inner
                .events_tx
                .send(BrokerEvent::TunnelClosed { target });
        }
        info!("Broker shut down");
    }

    /// Number of registered tunnels, for diagnostics.
    pub fn tunnel_count(&self) -> usize {
        self.inner.state.lock().unwrap().tunnels.len()
    }
}

/// One dial per target. Runs detached so no single caller's timeout can
/// cancel a handshake other waiters are counting on.
async fn run_dial(inner: Arc<BrokerInner>, target: Target, policy: Arc<dyn RelayPolicy>) {
    let result = dial_tunnel(&inner, &target, policy).await;

    // Registration and result delivery happen under one lock so a new
    // connect() either sees the registered tunnel or subscribes in time.
    let mut state = inner.state.lock().unwrap();
    let Some(dial) = state.dialing.remove(&target) else {
        // Shutdown cleared the dial while we were connecting.
        if let Ok(tunnel) = result {
            tokio::spawn(async move { tunnel.close().await });
        }
        return;
    };

    match result {
        Ok(tunnel) => {
            let tunnel = Arc::new(tunnel);
            if dial.waiters == 0 || state.shutting_down {
                // Everyone gave up; close instead of registering.
                drop(state);
                debug!("No surviving waiters for {}, discarding tunnel", target);
                tokio::spawn(async move { tunnel.close().await });
                return;
            }
            let endpoint = tunnel.endpoint();
            state.tunnels.insert(
                target.clone(),
                TunnelEntry {
                    tunnel: tunnel.clone(),
                    refcount: dial.waiters,
                    dial_generation: dial.generation,
                },
            );
            info!(
                "Registered tunnel for {} at {} (refcount {})",
                target, endpoint, dial.waiters
            );
            let _ = dial.result_tx.send(Ok(endpoint));
            drop(state);
            spawn_loss_watcher(inner, target, tunnel);
        }
        Err(e) => {
            warn!("Dial for {} failed: {}", target, e);
            let _ = dial.result_tx.send(Err(e));
        }
    }
}

async fn dial_tunnel(
    inner: &Arc<BrokerInner>,
    target: &Target,
    policy: Arc<dyn RelayPolicy>,
) -> TunnelResult<Tunnel> {
    let token = inner.credentials.bearer_token(target).await?;
    tokio::time::timeout(
        inner.config.connect_timeout,
        Tunnel::open(&inner.connector, target.clone(), &token, policy),
    )
    .await
    .map_err(|_| TunnelError::Timeout)?
}

/// Watches a registered tunnel's transport; on loss, unregisters it and
/// tells subscribers. Deliberate closes remove the entry first, so this
/// only fires for losses the broker did not initiate.
fn spawn_loss_watcher(inner: Arc<BrokerInner>, target: Target, tunnel: Arc<Tunnel>) {
    tokio::spawn(async move {
        let mut closed = tunnel.transport_closed();
        let reason = match closed.wait_for(|reason| reason.is_some()).await {
            Ok(guard) => guard.clone().unwrap_or(TransportError::ConnectionClosed),
            Err(_) => TransportError::ConnectionClosed,
        };

        let removed = {
            let mut state = inner.state.lock().unwrap();
            match state.tunnels.get(&target) {
                Some(entry) if Arc::ptr_eq(&entry.tunnel, &tunnel) => {
                    state.tunnels.remove(&target)
                }
                _ => None,
            }
        };

        if let Some(entry) = removed {
            warn!("Tunnel for {} lost: {}", target, reason);
            entry.tunnel.close().await;
            let _ = inner
                .events_tx
                .send(BrokerEvent::TunnelLost { target, reason });
        }
    });
}
