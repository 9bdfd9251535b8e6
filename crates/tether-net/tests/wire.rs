//! Engine behavior against a raw peer speaking the frame codec over an
//! in-memory pipe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use tether_core::{
    CloseReason, ConnectionId, Envelope, Frame, FrameCodec, MessageType, ProtocolError,
    RequestError, RequestId,
};
use tether_net::{ConnectionEvent, HandlerError, ReactorHandle, Server, handler_fn};
use tether_settings::{TetherSettings, UnknownTypePolicy};

const TIMEOUT: Duration = Duration::from_secs(5);
const MIB: usize = 1024 * 1024;

type Peer = Framed<DuplexStream, FrameCodec>;

fn settings() -> TetherSettings {
    let mut settings = TetherSettings::default();
    settings.server.shutdown_timeout_ms = 500;
    settings
}

/// Attach one end of a pipe to `server` and hand back the other end framed.
fn attach(server: &Server) -> (ConnectionId, Peer) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let connection = server.accept_transport(local, None).unwrap();
    (connection.id(), Framed::new(remote, FrameCodec::default()))
}

async fn next_envelope(peer: &mut Peer) -> Envelope {
    let frame = timeout(TIMEOUT, peer.next())
        .await
        .expect("peer read timed out")
        .expect("stream ended")
        .expect("decode failed");
    Envelope::from_frame(frame).unwrap()
}

async fn closed_reason(events: &mut broadcast::Receiver<ConnectionEvent>, id: ConnectionId) -> CloseReason {
    timeout(TIMEOUT, async {
        loop {
            if let ConnectionEvent::Closed { id: closed, reason } = events.recv().await.unwrap() {
                if closed == id {
                    return reason;
                }
            }
        }
    })
    .await
    .expect("no close event")
}

// ── Ordering ──

#[tokio::test]
async fn handlers_see_frames_in_arrival_order() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::channel(1);
    let sink = Arc::clone(&seen);
    server
        .handlers()
        .register(
            1u16,
            handler_fn(move |body: Bytes, _| {
                let sink = Arc::clone(&sink);
                let done_tx = done_tx.clone();
                async move {
                    let count = {
                        let mut seen = sink.lock();
                        seen.push(u32::from_be_bytes(body[..4].try_into().unwrap()));
                        seen.len()
                    };
                    if count == 100 {
                        let _ = done_tx.send(()).await;
                    }
                    Ok::<_, HandlerError>(Bytes::new())
                }
            }),
        )
        .unwrap();

    let (_id, mut peer) = attach(&server);
    for i in 0..100u32 {
        peer.feed(Frame::new(1u16, Bytes::copy_from_slice(&i.to_be_bytes())))
            .await
            .unwrap();
    }
    peer.flush().await.unwrap();

    timeout(TIMEOUT, done_rx.recv()).await.unwrap();
    assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
}

// ── Framing violations ──

#[tokio::test]
async fn oversize_declared_length_closes_without_dispatch() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let dispatched = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&dispatched);
    server
        .handlers()
        .register(
            1u16,
            handler_fn(move |_, _| {
                *counter.lock() += 1;
                async { Ok::<_, HandlerError>(Bytes::new()) }
            }),
        )
        .unwrap();
    let mut events = server.subscribe();

    let (local, mut remote) = tokio::io::duplex(1024);
    let id = server.accept_transport(local, None).unwrap().id();

    let mut header = BytesMut::new();
    header.put_u32(u32::try_from(20 * MIB).unwrap());
    header.put_u16(1);
    remote.write_all(&header).await.unwrap();

    let reason = closed_reason(&mut events, id).await;
    assert_eq!(
        reason,
        CloseReason::Protocol(ProtocolError::FrameTooLarge {
            length: 20 * MIB,
            max: 16 * MIB,
        })
    );
    assert_eq!(*dispatched.lock(), 0);
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn eof_inside_frame_is_corrupt() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let mut events = server.subscribe();
    let (local, mut remote) = tokio::io::duplex(1024);
    let id = server.accept_transport(local, None).unwrap().id();

    remote.write_all(&[0, 0, 0, 10, 0, 1, b'a', b'b']).await.unwrap();
    drop(remote);

    assert_matches!(
        closed_reason(&mut events, id).await,
        CloseReason::Protocol(ProtocolError::FrameCorrupt(_))
    );
}

#[tokio::test]
async fn clean_eof_is_peer_closed() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let mut events = server.subscribe();
    let (id, peer) = attach(&server);
    drop(peer);
    assert_eq!(closed_reason(&mut events, id).await, CloseReason::PeerClosed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn established_is_published_before_closed() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let mut events = server.subscribe();
    let mut ids = Vec::new();
    for _ in 0..100 {
        let (local, remote) = tokio::io::duplex(1024);
        drop(remote);
        ids.push(server.accept_transport(local, None).unwrap().id());
    }

    let mut established = std::collections::HashSet::new();
    let mut closed = 0;
    timeout(TIMEOUT, async {
        while closed < ids.len() {
            match events.recv().await.unwrap() {
                ConnectionEvent::Established { id, .. } => {
                    established.insert(id);
                }
                ConnectionEvent::Closed { id, .. } => {
                    assert!(established.contains(&id), "{id} closed before it was established");
                    closed += 1;
                }
            }
        }
    })
    .await
    .unwrap();
    let _ = server.stop().await;
}

// ── Unknown types ──

#[tokio::test]
async fn unknown_request_gets_error_response_under_drop_policy() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let (id, mut peer) = attach(&server);

    peer.send(Frame::new(0x0042u16, Bytes::from_static(b"ignored")))
        .await
        .unwrap();
    let request = Envelope::Request {
        request_id: RequestId::from_raw(77),
        message_type: MessageType(0x0042),
        body: Bytes::new(),
    };
    peer.send(request.into_frame()).await.unwrap();

    assert_matches!(
        next_envelope(&mut peer).await,
        Envelope::ErrorResponse { request_id, message }
            if request_id == RequestId::from_raw(77) && message.contains("0x0042")
    );
    assert!(server.sessions().contains(id));
}

#[tokio::test]
async fn unknown_type_closes_under_close_policy() {
    let mut settings = settings();
    settings.connection.unknown_type_policy = UnknownTypePolicy::Close;
    let server = Server::new(ReactorHandle::current(), &settings);
    let mut events = server.subscribe();
    let (id, mut peer) = attach(&server);

    peer.send(Frame::new(0x0042u16, Bytes::new())).await.unwrap();

    assert_eq!(
        closed_reason(&mut events, id).await,
        CloseReason::Protocol(ProtocolError::UnknownMessageType(0x0042))
    );
}

// ── Handler replies ──

#[tokio::test]
async fn failing_handler_replies_with_error_response() {
    let server = Server::new(ReactorHandle::current(), &settings());
    server
        .handlers()
        .register(
            5u16,
            handler_fn(|_, _| async { Err::<Bytes, _>(HandlerError::failed("divide by zero")) }),
        )
        .unwrap();
    let (_id, mut peer) = attach(&server);

    let request = Envelope::Request {
        request_id: RequestId::from_raw(1),
        message_type: MessageType(5),
        body: Bytes::new(),
    };
    peer.send(request.into_frame()).await.unwrap();

    assert_matches!(
        next_envelope(&mut peer).await,
        Envelope::ErrorResponse { message, .. } if message.contains("divide by zero")
    );
}

#[tokio::test]
async fn slow_handler_times_out() {
    let mut settings = settings();
    settings.connection.handler_timeout_ms = 50;
    let server = Server::new(ReactorHandle::current(), &settings);
    server
        .handlers()
        .register(
            5u16,
            handler_fn(|body, _| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, HandlerError>(body)
            }),
        )
        .unwrap();
    let (_id, mut peer) = attach(&server);

    let request = Envelope::Request {
        request_id: RequestId::from_raw(9),
        message_type: MessageType(5),
        body: Bytes::new(),
    };
    peer.send(request.into_frame()).await.unwrap();

    assert_matches!(
        next_envelope(&mut peer).await,
        Envelope::ErrorResponse { request_id, message }
            if request_id == RequestId::from_raw(9) && message.contains("timed out")
    );
}

// ── Correlation ──

#[tokio::test]
async fn out_of_order_responses_reach_their_callers() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let (id, mut peer) = attach(&server);

    let first = server.call(id, 3u16, Bytes::from_static(b"one"), TIMEOUT);
    let second = server.call(id, 3u16, Bytes::from_static(b"two"), TIMEOUT);
    let third = server.call(id, 3u16, Bytes::from_static(b"three"), TIMEOUT);

    let mut requests = Vec::new();
    for _ in 0..3 {
        match next_envelope(&mut peer).await {
            Envelope::Request {
                request_id,
                message_type,
                body,
            } => {
                assert_eq!(message_type, MessageType(3));
                requests.push((request_id, body));
            }
            other => panic!("expected a request, got {other:?}"),
        }
    }

    for index in [1, 2, 0] {
        let (request_id, body) = requests[index].clone();
        let mut reply = BytesMut::from(&b"re:"[..]);
        reply.extend_from_slice(&body);
        peer.send(
            Envelope::Response {
                request_id,
                body: reply.freeze(),
            }
            .into_frame(),
        )
        .await
        .unwrap();
    }

    assert_eq!(&first.await.unwrap()[..], b"re:one");
    assert_eq!(&second.await.unwrap()[..], b"re:two");
    assert_eq!(&third.await.unwrap()[..], b"re:three");
}

#[tokio::test]
async fn responses_resolve_while_the_handler_queue_is_full() {
    let mut settings = settings();
    settings.connection.handler_queue_capacity = 1;
    let server = Server::new(ReactorHandle::current(), &settings);
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let held = Arc::clone(&gate);
    server
        .handlers()
        .register(
            1u16,
            handler_fn(move |_, _| {
                let held = Arc::clone(&held);
                async move {
                    let _permit = held.acquire().await;
                    Ok::<_, HandlerError>(Bytes::new())
                }
            }),
        )
        .unwrap();
    let (id, mut peer) = attach(&server);

    // One job running, one queued, one waiting for queue space.
    for _ in 0..3 {
        peer.send(Frame::new(1u16, Bytes::new())).await.unwrap();
    }

    let started = Instant::now();
    let call = server.call(id, 2u16, Bytes::from_static(b"ping"), Duration::from_secs(2));
    let Envelope::Request { request_id, body, .. } = next_envelope(&mut peer).await else {
        panic!("expected a request");
    };
    assert_eq!(&body[..], b"ping");
    peer.send(
        Envelope::Response {
            request_id,
            body: Bytes::from_static(b"pong"),
        }
        .into_frame(),
    )
    .await
    .unwrap();

    assert_eq!(&call.await.unwrap()[..], b"pong");
    assert!(started.elapsed() < Duration::from_secs(1));
    gate.add_permits(3);
    let _ = server.stop().await;
}

#[tokio::test]
async fn unanswered_call_times_out_and_late_response_is_dropped() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let (id, mut peer) = attach(&server);

    let started = Instant::now();
    let call = server.call(id, 3u16, Bytes::new(), Duration::from_millis(100));
    let result = call.await;
    let elapsed = started.elapsed();

    assert_matches!(result, Err(RequestError::Timeout { timeout, .. }) if timeout == Duration::from_millis(100));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");

    let Envelope::Request { request_id, .. } = next_envelope(&mut peer).await else {
        panic!("expected the request");
    };
    peer.send(
        Envelope::Response {
            request_id,
            body: Bytes::new(),
        }
        .into_frame(),
    )
    .await
    .unwrap();

    // The late response is discarded and the connection keeps working.
    let ping = server.call(id, 3u16, Bytes::from_static(b"ping"), TIMEOUT);
    let Envelope::Request { request_id, .. } = next_envelope(&mut peer).await else {
        panic!("expected the second request");
    };
    peer.send(
        Envelope::Response {
            request_id,
            body: Bytes::from_static(b"pong"),
        }
        .into_frame(),
    )
    .await
    .unwrap();
    assert_eq!(&ping.await.unwrap()[..], b"pong");
}

#[tokio::test]
async fn peer_close_fails_every_pending_call() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let (id, mut peer) = attach(&server);

    let calls: Vec<_> = (0..3)
        .map(|_| server.call(id, 3u16, Bytes::new(), Duration::from_secs(60)))
        .collect();
    for _ in 0..3 {
        let _ = next_envelope(&mut peer).await;
    }
    drop(peer);

    for call in calls {
        let result = timeout(TIMEOUT, call).await.expect("call did not resolve");
        assert_matches!(result, Err(RequestError::ConnectionClosed));
    }
}

#[tokio::test]
async fn response_from_other_connection_is_ignored() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let (target, mut target_peer) = attach(&server);
    let (_other, mut other_peer) = attach(&server);

    let call = server.call(target, 3u16, Bytes::new(), Duration::from_millis(300));
    let Envelope::Request { request_id, .. } = next_envelope(&mut target_peer).await else {
        panic!("expected the request");
    };
    other_peer
        .send(
            Envelope::Response {
                request_id,
                body: Bytes::from_static(b"spoofed"),
            }
            .into_frame(),
        )
        .await
        .unwrap();

    target_peer
        .send(
            Envelope::Response {
                request_id,
                body: Bytes::from_static(b"genuine"),
            }
            .into_frame(),
        )
        .await
        .unwrap();
    assert_eq!(&call.await.unwrap()[..], b"genuine");
}

#[tokio::test]
async fn stop_resolves_pending_calls() {
    let server = Server::new(ReactorHandle::current(), &settings());
    let (id, _peer) = attach(&server);
    let call = server.call(id, 3u16, Bytes::new(), Duration::from_secs(60));

    assert!(server.stop().await);
    assert_matches!(call.await, Err(RequestError::ConnectionClosed));
    assert!(server.sessions().is_empty());
}
