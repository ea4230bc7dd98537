//! In-process stub relay for integration tests
//!
//! Speaks the real wire protocol over plaintext TCP on a loopback port.
//! Behavior is scripted per instance so tests can exercise refusals,
//! silent peers, and mid-handshake disconnects without a real relay.

use crate::connection::{control_frame, read_frame, write_frame};
use crate::error::TransportResult;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use vmrelay_proto::{Frame, FrameFlags, FrameType, RefusalReason, RelayMessage};

/// How the stub answers the handshake and subsequent traffic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StubBehavior {
    /// Accept the handshake and echo every data frame back on its stream.
    Echo,
    /// Refuse the handshake with an invalid-credential refusal.
    RefuseCredential,
    /// Refuse the handshake with an access-denied refusal.
    RefuseAccess,
    /// Read the hello and never answer.
    SilentHandshake,
    /// Read the hello and close the socket without answering.
    CloseDuringHandshake,
    /// Accept the handshake but refuse every stream open.
    RefuseStreams,
    /// Accept the handshake, then send an undecodable frame.
    GarbageAfterHello,
    /// Behave like [`StubBehavior::Echo`] after delaying the hello
    /// reply, so caller-side waits can expire mid-dial.
    SlowHandshake(Duration),
}

/// A scripted relay listening on a loopback port.
pub struct StubRelay {
    addr: SocketAddr,
    handshakes: Arc<AtomicUsize>,
    streams_opened: Arc<AtomicUsize>,
    drop_signal: Arc<Notify>,
    accept_task: JoinHandle<()>,
}

impl StubRelay {
    pub async fn spawn(behavior: StubBehavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let handshakes = Arc::new(AtomicUsize::new(0));
        let streams_opened = Arc::new(AtomicUsize::new(0));
        let drop_signal = Arc::new(Notify::new());

        let accept_handshakes = handshakes.clone();
        let accept_streams = streams_opened.clone();
        let accept_drop = drop_signal.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    return;
                };
                debug!("Stub relay accepted connection from {}", peer);
                let handshakes = accept_handshakes.clone();
                let streams = accept_streams.clone();
                let drop_signal = accept_drop.clone();
                tokio::spawn(async move {
                    let _ =
                        serve_connection(socket, behavior, handshakes, streams, drop_signal).await;
                });
            }
        });

        Ok(Self {
            addr,
            handshakes,
            streams_opened,
            drop_signal,
            accept_task,
        })
    }

    /// Endpoint string suitable for `RelayClientConfig::plaintext`.
    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Number of hello exchanges the stub has seen.
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Number of logical streams the stub has accepted.
    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    /// Drop every established connection, as if the relay went away.
    pub fn drop_established(&self) {
        self.drop_signal.notify_waiters();
    }
}

impl Drop for StubRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    behavior: StubBehavior,
    handshakes: Arc<AtomicUsize>,
    streams_opened: Arc<AtomicUsize>,
    drop_signal: Arc<Notify>,
) -> TransportResult<()> {
    let hello = match read_frame(&mut socket).await? {
        Some(frame) => frame,
        None => return Ok(()),
    };
    if hello.frame_type != FrameType::Control {
        return Ok(());
    }
    let Ok(RelayMessage::ClientHello { .. }) = RelayMessage::decode(&hello.payload) else {
        return Ok(());
    };
    handshakes.fetch_add(1, Ordering::SeqCst);

    match behavior {
        StubBehavior::SilentHandshake => {
            // Hold the socket open without answering.
            let _ = read_frame(&mut socket).await;
            return Ok(());
        }
        StubBehavior::CloseDuringHandshake => return Ok(()),
        StubBehavior::RefuseCredential => {
            let refusal = control_frame(&RelayMessage::Refused {
                reason: RefusalReason::InvalidCredential,
            })?;
            write_frame(&mut socket, &refusal).await?;
            return Ok(());
        }
        StubBehavior::RefuseAccess => {
            let refusal = control_frame(&RelayMessage::Refused {
                reason: RefusalReason::AccessDenied,
            })?;
            write_frame(&mut socket, &refusal).await?;
            return Ok(());
        }
        StubBehavior::SlowHandshake(delay) => tokio::time::sleep(delay).await,
        StubBehavior::Echo | StubBehavior::RefuseStreams | StubBehavior::GarbageAfterHello => {}
    }

    let server_hello = control_frame(&RelayMessage::ServerHello {
        session_id: "stub-session".to_string(),
    })?;
    write_frame(&mut socket, &server_hello).await?;

    if behavior == StubBehavior::GarbageAfterHello {
        // Valid header, payload that does not decode as a control message.
        let garbage = Frame::control(Bytes::from_static(&[0xff; 16]));
        write_frame(&mut socket, &garbage).await?;
        return Ok(());
    }

    loop {
        let frame = tokio::select! {
            read = read_frame(&mut socket) => match read? {
                Some(frame) => frame,
                None => return Ok(()),
            },
            // Scripted relay failure: hang up without a close frame.
            _ = drop_signal.notified() => return Ok(()),
        };
        match frame.frame_type {
            FrameType::Control => match RelayMessage::decode(&frame.payload) {
                Ok(RelayMessage::OpenStream { stream_id }) => {
                    let reply = if behavior == StubBehavior::RefuseStreams {
                        RelayMessage::StreamRefused {
                            stream_id,
                            reason: "Destination unreachable".to_string(),
                        }
                    } else {
                        streams_opened.fetch_add(1, Ordering::SeqCst);
                        RelayMessage::StreamOpened { stream_id }
                    };
                    write_frame(&mut socket, &control_frame(&reply)?).await?;
                }
                Ok(RelayMessage::Ping { timestamp }) => {
                    let pong = control_frame(&RelayMessage::Pong { timestamp })?;
                    write_frame(&mut socket, &pong).await?;
                }
                _ => {}
            },
            FrameType::Data => {
                // Echo on the same stream.
                write_frame(&mut socket, &frame).await?;
            }
            FrameType::Close => {
                let fin = Frame::close(frame.stream_id).with_flags(FrameFlags::new().with_fin());
                write_frame(&mut socket, &fin).await?;
            }
        }
    }
}
