//! Broker integration tests: dial dedup, reference counting, grace
//! period, and event notifications, all against the stub relay.

use std::sync::Arc;
use std::time::Duration;
use vmrelay_client::policy::{AllowAllRelayPolicy, RelayPolicy};
use vmrelay_client::{
    BrokerConfig, BrokerEvent, StaticCredential, TunnelBroker, TunnelError,
};
use vmrelay_proto::Target;
use vmrelay_transport::test_util::{StubBehavior, StubRelay};
use vmrelay_transport::{RelayClientConfig, RelayConnector, TransportError};

const WAIT: Duration = Duration::from_secs(10);

fn test_target() -> Target {
    Target::new("test-project", "us-central1-a", "vm-1", 3389)
}

fn policy() -> Arc<dyn RelayPolicy> {
    Arc::new(AllowAllRelayPolicy)
}

fn broker_for(relay: &StubRelay, grace_period: Duration) -> TunnelBroker {
    let config = RelayClientConfig::plaintext(relay.endpoint())
        .with_handshake_timeout(Duration::from_secs(5))
        .with_stream_open_timeout(Duration::from_secs(5));
    let connector = RelayConnector::new(config).unwrap();
    TunnelBroker::new(
        connector,
        Arc::new(StaticCredential::new("valid-token")),
        BrokerConfig {
            connect_timeout: Duration::from_secs(10),
            grace_period,
        },
    )
}

#[tokio::test]
async fn test_concurrent_connects_share_one_dial() {
    let relay = StubRelay::spawn(StubBehavior::Echo).await.unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let broker = broker.clone();
        let target = target.clone();
        tasks.push(tokio::spawn(async move {
            broker.connect(&target, policy(), WAIT).await
        }));
    }

    let mut ports = Vec::new();
    for task in tasks {
        ports.push(task.await.unwrap().unwrap().port);
    }

    assert_eq!(relay.handshakes(), 1, "All callers must share one dial");
    assert!(ports.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(broker.tunnel_count(), 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_sequential_connect_reuses_tunnel() {
    let relay = StubRelay::spawn(StubBehavior::Echo).await.unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();

    let first = broker.connect(&target, policy(), WAIT).await.unwrap();
    let second = broker.connect(&target, policy(), WAIT).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(relay.handshakes(), 1);

    // Two references: one disconnect keeps the tunnel alive.
    broker.disconnect(&target);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.try_activate(&target).is_some());

    broker.disconnect(&target);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.try_activate(&target).is_none());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let relay = StubRelay::spawn(StubBehavior::Echo).await.unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();

    broker.connect(&target, policy(), WAIT).await.unwrap();

    broker.disconnect(&target);
    broker.disconnect(&target);
    broker.disconnect(&target);
    broker.disconnect(&Target::new("other", "zone", "vm", 22));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.tunnel_count(), 0);

    // A fresh connect builds a new tunnel.
    broker.connect(&target, policy(), WAIT).await.unwrap();
    assert_eq!(relay.handshakes(), 2);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_grace_period_allows_quick_reconnect() {
    let relay = StubRelay::spawn(StubBehavior::Echo).await.unwrap();
    let broker = broker_for(&relay, Duration::from_millis(500));
    let target = test_target();

    let first = broker.connect(&target, policy(), WAIT).await.unwrap();
    broker.disconnect(&target);

    // Inside the grace window the same tunnel is still there.
    let second = broker.connect(&target, policy(), WAIT).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(relay.handshakes(), 1);

    // The earlier grace task must not tear down the re-referenced tunnel.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(broker.try_activate(&target).is_some());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_credential_rejection_leaves_registry_empty() {
    let relay = StubRelay::spawn(StubBehavior::RefuseCredential).await.unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();

    let err = broker.connect(&target, policy(), WAIT).await.unwrap_err();
    assert_eq!(
        err,
        TunnelError::Transport(TransportError::CredentialRejected)
    );
    assert_eq!(broker.tunnel_count(), 0);
    assert!(broker.try_activate(&target).is_none());
}

#[tokio::test]
async fn test_probe_failure_leaves_registry_empty_and_next_connect_dials() {
    let relay = StubRelay::spawn(StubBehavior::RefuseStreams).await.unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();

    let err = broker.connect(&target, policy(), WAIT).await.unwrap_err();
    assert!(matches!(
        err,
        TunnelError::Transport(TransportError::NetworkUnreachable(_))
    ));
    assert_eq!(broker.tunnel_count(), 0);

    // No poisoned state: the next connect starts a fresh dial.
    let _ = broker.connect(&target, policy(), WAIT).await.unwrap_err();
    assert_eq!(relay.handshakes(), 2);
}

#[tokio::test]
async fn test_caller_timeout_does_not_cancel_shared_dial() {
    let relay = StubRelay::spawn(StubBehavior::SilentHandshake).await.unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();

    let impatient = broker
        .connect(&target, policy(), Duration::from_millis(100))
        .await;
    assert_eq!(impatient.unwrap_err(), TunnelError::Timeout);

    // The dial keeps running for its own handshake window.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relay.handshakes(), 1);
}

#[tokio::test]
async fn test_try_activate_takes_no_reference() {
    let relay = StubRelay::spawn(StubBehavior::Echo).await.unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();

    broker.connect(&target, policy(), WAIT).await.unwrap();
    assert!(broker.try_activate(&target).is_some());
    assert!(broker.try_activate(&target).is_some());

    // One disconnect balances the single connect; the lookups above
    // must not have pinned the tunnel.
    broker.disconnect(&target);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.try_activate(&target).is_none());
}

#[tokio::test]
async fn test_teardown_emits_closed_event() {
    let relay = StubRelay::spawn(StubBehavior::Echo).await.unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();
    let mut events = broker.events();

    broker.connect(&target, policy(), WAIT).await.unwrap();
    broker.disconnect(&target);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        BrokerEvent::TunnelClosed { target: closed } => assert_eq!(closed, target),
        other => panic!("Unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_transport_loss_emits_tunnel_lost_and_unregisters() {
    let relay = StubRelay::spawn(StubBehavior::Echo).await.unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();
    let mut events = broker.events();

    broker.connect(&target, policy(), WAIT).await.unwrap();
    assert_eq!(broker.tunnel_count(), 1);

    // The relay hangs up underneath the registered tunnel.
    relay.drop_established();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        BrokerEvent::TunnelLost { target: lost, reason } => {
            assert_eq!(lost, target);
            assert!(reason.is_retryable(), "Loss reason was {:?}", reason);
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    assert_eq!(broker.tunnel_count(), 0);
    assert!(broker.try_activate(&target).is_none());

    // Not poisoned: a new connect dials fresh.
    broker.connect(&target, policy(), WAIT).await.unwrap();
    assert_eq!(relay.handshakes(), 2);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_dial_discards_unreferenced_tunnel() {
    let relay = StubRelay::spawn(StubBehavior::SlowHandshake(Duration::from_millis(300)))
        .await
        .unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();

    let impatient = broker
        .connect(&target, policy(), Duration::from_millis(100))
        .await;
    assert_eq!(impatient.unwrap_err(), TunnelError::Timeout);

    // The dial completes with zero surviving waiters: the fresh tunnel
    // must be closed, not registered.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(relay.handshakes(), 1);
    assert_eq!(broker.tunnel_count(), 0);
    assert!(broker.try_activate(&target).is_none());

    // The abandoned wait must not have damaged later dials.
    broker.connect(&target, policy(), WAIT).await.unwrap();
    assert_eq!(relay.handshakes(), 2);
    assert!(broker.try_activate(&target).is_some());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let relay = StubRelay::spawn(StubBehavior::Echo).await.unwrap();
    let broker = broker_for(&relay, Duration::from_secs(30));
    let target = test_target();

    broker.connect(&target, policy(), WAIT).await.unwrap();
    broker.shutdown().await;

    assert_eq!(broker.tunnel_count(), 0);
    assert!(broker.try_activate(&target).is_none());

    let err = broker.connect(&target, policy(), WAIT).await.unwrap_err();
    assert_eq!(err, TunnelError::ShuttingDown);
}

#[tokio::test]
async fn test_new_tunnel_after_teardown_gets_new_listener() {
    let relay = StubRelay::spawn(StubBehavior::Echo).await.unwrap();
    let broker = broker_for(&relay, Duration::ZERO);
    let target = test_target();

    let first = broker.connect(&target, policy(), WAIT).await.unwrap();
    broker.disconnect(&target);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = broker.connect(&target, policy(), WAIT).await.unwrap();
    assert_eq!(relay.handshakes(), 2);
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", second.port))
        .await
        .is_ok());
    let _ = first;

    broker.shutdown().await;
}
