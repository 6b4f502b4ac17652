// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::envelope::{Envelope, Role};
use crate::core::frame::Frame;
use crate::core::payload::encode_packet;
use crate::core::schema::{FieldKind, Packet, Schema};
use crate::error::{LostReason, ProtocolError};
use crate::protocol::connection::{Connection, ConnectionContext, ConnectionOptions, Side};
use crate::protocol::message::{type_ids, ControlMessage};
use crate::service::secure::{ChannelOptions, SecureState};
use crate::transport::Link;
use crate::utils::compression::CompressionKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Add {
    x: i32,
    y: i32,
}

impl Packet for Add {
    const NAME: &'static str = "test.Add";

    fn schema() -> Schema {
        Schema::new().field("x", FieldKind::I32).field("y", FieldKind::I32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sum {
    result: i32,
}

impl Packet for Sum {
    const NAME: &'static str = "test.Sum";

    fn schema() -> Schema {
        Schema::new().field("result", FieldKind::I32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    seq: u32,
    text: String,
}

impl Packet for Note {
    const NAME: &'static str = "test.Note";

    fn schema() -> Schema {
        Schema::new()
            .field("seq", FieldKind::U32)
            .field("text", FieldKind::String)
    }
}

fn options(secure: bool) -> ConnectionOptions {
    ConnectionOptions {
        connection_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(1),
        request_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(1),
        write_queue: 64,
        channel: ChannelOptions {
            secure,
            sign_frames: secure,
            compression: None,
            max_payload: MAX_PAYLOAD_SIZE,
        },
        accept_unknown_types: false,
    }
}

async fn connect_over(
    a: Link,
    b: Link,
    opts_a: ConnectionOptions,
    opts_b: ConnectionOptions,
    ctx_a: ConnectionContext,
    ctx_b: ConnectionContext,
) -> (Connection, Connection) {
    let (initiator, acceptor) = tokio::join!(
        Connection::establish(a, Side::Initiator, ctx_a, opts_a),
        Connection::establish(b, Side::Acceptor, ctx_b, opts_b),
    );
    (initiator.unwrap(), acceptor.unwrap())
}

async fn connected(
    secure: bool,
    ctx_a: ConnectionContext,
    ctx_b: ConnectionContext,
) -> (Connection, Connection) {
    let (a, b) = Link::pair(MAX_PAYLOAD_SIZE);
    connect_over(a, b, options(secure), options(secure), ctx_a, ctx_b).await
}

fn adder() -> ConnectionContext {
    let ctx = ConnectionContext::default();
    ctx.handlers
        .on_request::<Add, Sum, _>(&ctx.registry, |req, _| {
            Ok(Sum {
                result: req.x + req.y,
            })
        })
        .unwrap();
    ctx
}

#[tokio::test]
async fn test_secure_request_response() {
    let (client, server) = connected(true, ConnectionContext::default(), adder()).await;
    assert_eq!(client.secure_state(), SecureState::Secured);
    assert_eq!(server.secure_state(), SecureState::Secured);

    let sum: Sum = client.send_request(&Add { x: 3, y: 4 }).await.unwrap();
    assert_eq!(sum.result, 7);
    assert_eq!(client.outstanding_requests(), 0);
}

#[tokio::test]
async fn test_insecure_request_response() {
    let (client, server) = connected(false, ConnectionContext::default(), adder()).await;
    assert_eq!(client.secure_state(), SecureState::Unsecured);
    assert_eq!(server.secure_state(), SecureState::Unsecured);

    let sum: Sum = client.send_request(&Add { x: -2, y: 9 }).await.unwrap();
    assert_eq!(sum.result, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_not_cross_delivered() {
    let (client, _server) = connected(true, ConnectionContext::default(), adder()).await;

    let requests = (0..64).map(|i| {
        let client = client.clone();
        async move {
            let sum: Sum = client.send_request(&Add { x: i, y: 1000 }).await.unwrap();
            (i, sum.result)
        }
    });
    for (i, result) in join_all(requests).await {
        assert_eq!(result, i + 1000);
    }
}

#[tokio::test]
async fn test_type_announced_once_per_connection() {
    let client_ctx = ConnectionContext::default();
    let server_ctx = ConnectionContext::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server_ctx
        .handlers
        .on::<Note, _>(&server_ctx.registry, move |note, _| {
            let _ = tx.send(note);
        })
        .unwrap();

    let (client, _server) = connected(true, client_ctx.clone(), server_ctx.clone()).await;
    assert!(!client.is_announced::<Note>());

    let sends = (0..10).map(|seq| {
        let client = client.clone();
        async move {
            client
                .send(&Note {
                    seq,
                    text: "hi".into(),
                })
                .await
        }
    });
    for result in join_all(sends).await {
        result.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..10 {
        seen.push(rx.recv().await.unwrap().seq);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert!(client.is_announced::<Note>());
    assert_eq!(client_ctx.metrics.snapshot().registrations_sent, 1);
    assert_eq!(server_ctx.metrics.snapshot().registrations_accepted, 1);
}

#[tokio::test]
async fn test_handlers_see_arrival_order() {
    let server_ctx = ConnectionContext::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server_ctx
        .handlers
        .on::<Note, _>(&server_ctx.registry, move |note, _| {
            let _ = tx.send(note.seq);
        })
        .unwrap();

    let (client, _server) = connected(false, ConnectionContext::default(), server_ctx).await;
    for seq in 0..50 {
        client
            .send(&Note {
                seq,
                text: String::new(),
            })
            .await
            .unwrap();
    }
    for expected in 0..50 {
        assert_eq!(rx.recv().await.unwrap(), expected);
    }
}

#[tokio::test]
async fn test_connection_handler_overrides_container_handler() {
    let server_ctx = ConnectionContext::default();
    let container_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&container_hits);
    server_ctx
        .handlers
        .on::<Note, _>(&server_ctx.registry, move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let (client, server) = connected(false, ConnectionContext::default(), server_ctx).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .on::<Note, _>(move |note, conn| {
            let _ = tx.send((note.seq, conn.id()));
        })
        .unwrap();

    client
        .send(&Note {
            seq: 5,
            text: "own".into(),
        })
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), (5, server.id()));
    assert_eq!(container_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_type_refused() {
    let server_ctx = ConnectionContext::default();
    let (client, server) = connected(true, ConnectionContext::default(), server_ctx.clone()).await;

    let result = client
        .send(&Note {
            seq: 1,
            text: "nobody knows me".into(),
        })
        .await;
    assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    assert_eq!(server_ctx.metrics.snapshot().registrations_rejected, 1);
    assert!(client.is_alive());
    assert!(server.is_alive());
}

#[tokio::test]
async fn test_unknown_type_accepted_when_allowed() {
    let server_ctx = ConnectionContext::default();
    let (a, b) = Link::pair(MAX_PAYLOAD_SIZE);
    let mut lenient = options(false);
    lenient.accept_unknown_types = true;
    let (client, _server) = connect_over(
        a,
        b,
        options(false),
        lenient,
        ConnectionContext::default(),
        server_ctx.clone(),
    )
    .await;

    client
        .send(&Note {
            seq: 1,
            text: "learn me".into(),
        })
        .await
        .unwrap();
    let entry = server_ctx.registry.lookup(Note::NAME).unwrap().unwrap();
    assert_eq!(entry.descriptor.schema, Note::schema());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_then_late_response_discarded() {
    let server_ctx = ConnectionContext::default();
    server_ctx
        .handlers
        .on_request::<Add, Sum, _>(&server_ctx.registry, |req, _| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Sum {
                result: req.x + req.y,
            })
        })
        .unwrap();
    let client_ctx = ConnectionContext::default();
    let (client, _server) = connected(true, client_ctx.clone(), server_ctx).await;

    let result: Result<Sum, _> = client
        .send_request_timeout(&Add { x: 1, y: 1 }, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
    assert_eq!(client.outstanding_requests(), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let metrics = client_ctx.metrics.snapshot();
    assert_eq!(metrics.requests_timed_out, 1);
    assert_eq!(metrics.late_responses, 1);
    assert!(client.is_alive());

    let sum: Sum = client.send_request(&Add { x: 2, y: 2 }).await.unwrap();
    assert_eq!(sum.result, 4);
}

#[tokio::test]
async fn test_pending_requests_fail_on_loss() {
    let server_ctx = ConnectionContext::default();
    // known type, no handler: the request is never answered
    server_ctx.registry.register::<Add>().unwrap();
    server_ctx.registry.register::<Sum>().unwrap();
    let (client, server) = connected(true, ConnectionContext::default(), server_ctx).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.send_request::<Add, Sum>(&Add { x: 1, y: 2 }).await })
    };
    while client.outstanding_requests() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    server.abort();

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("pending request must not hang")
        .unwrap();
    assert!(matches!(
        result,
        Err(ProtocolError::ConnectionLost(LostReason::TransportClosed))
    ));
}

#[tokio::test]
async fn test_close_reports_peer_closed() {
    let (client, server) =
        connected(true, ConnectionContext::default(), ConnectionContext::default()).await;
    client.close().await;
    assert_eq!(server.closed().await, LostReason::PeerClosed);
    assert_eq!(client.lost_reason(), Some(LostReason::ClosedLocally));
    assert!(matches!(
        client.send(&Note { seq: 0, text: String::new() }).await,
        Err(ProtocolError::ConnectionLost(LostReason::ClosedLocally))
    ));
}

#[tokio::test]
async fn test_abort_reports_transport_closed() {
    let (client, server) =
        connected(false, ConnectionContext::default(), ConnectionContext::default()).await;
    client.abort();
    assert_eq!(server.closed().await, LostReason::TransportClosed);
    assert_eq!(client.closed().await, LostReason::ClosedLocally);
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (a, _silent) = Link::pair(MAX_PAYLOAD_SIZE);
    let mut opts = options(false);
    opts.connection_timeout = Duration::from_millis(200);
    opts.heartbeat_interval = Duration::from_millis(50);
    let conn = Connection::establish(a, Side::Initiator, ConnectionContext::default(), opts)
        .await
        .unwrap();
    assert_eq!(conn.closed().await, LostReason::Timeout);
}

#[tokio::test]
async fn test_heartbeats_keep_idle_connection_alive() {
    let mut opts = options(false);
    opts.connection_timeout = Duration::from_millis(300);
    opts.heartbeat_interval = Duration::from_millis(50);
    let ctx = ConnectionContext::default();
    let (a, b) = Link::pair(MAX_PAYLOAD_SIZE);
    let (client, server) = connect_over(
        a,
        b,
        opts.clone(),
        opts,
        ctx.clone(),
        ConnectionContext::default(),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(client.is_alive());
    assert!(server.is_alive());
    assert!(ctx.metrics.snapshot().heartbeats_sent >= 5);
}

#[tokio::test]
async fn test_insecure_acceptor_refuses_key_exchange() {
    let (a, b) = Link::pair(MAX_PAYLOAD_SIZE);
    let (initiator, acceptor) = tokio::join!(
        Connection::establish(a, Side::Initiator, ConnectionContext::default(), options(true)),
        Connection::establish(b, Side::Acceptor, ConnectionContext::default(), options(false)),
    );
    assert!(initiator.is_err());
    assert!(acceptor.unwrap().closed().await.is_security());
}

#[tokio::test]
async fn test_tampered_signature_closes_with_security_reason() {
    let (client_link, relay_client_side) = Link::pair(MAX_PAYLOAD_SIZE);
    let (relay_server_side, server_link) = Link::pair(MAX_PAYLOAD_SIZE);
    let Link {
        stream: mut from_client,
        sink: mut to_client,
        ..
    } = relay_client_side;
    let Link {
        stream: mut from_server,
        sink: mut to_server,
        ..
    } = relay_server_side;

    tokio::spawn(async move {
        while let Some(Ok(mut frame)) = from_client.next().await {
            if frame.type_id >= type_ids::FIRST_APPLICATION {
                if let Some(signature) = frame.signature.as_mut() {
                    signature[0] ^= 0xFF;
                }
            }
            if to_server.send(frame).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        while let Some(Ok(frame)) = from_server.next().await {
            if to_client.send(frame).await.is_err() {
                break;
            }
        }
    });

    let server_ctx = ConnectionContext::default();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    server_ctx
        .handlers
        .on::<Note, _>(&server_ctx.registry, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let (client, server) = connect_over(
        client_link,
        server_link,
        options(true),
        options(true),
        ConnectionContext::default(),
        server_ctx.clone(),
    )
    .await;

    client
        .send(&Note {
            seq: 1,
            text: "tampered in flight".into(),
        })
        .await
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), server.closed())
        .await
        .unwrap();
    assert!(reason.is_security(), "unexpected reason {reason}");
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(server_ctx.metrics.snapshot().security_failures, 1);
}

#[tokio::test]
async fn test_compressed_secure_exchange() {
    let server_ctx = ConnectionContext::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server_ctx
        .handlers
        .on::<Note, _>(&server_ctx.registry, move |note, _| {
            let _ = tx.send(note);
        })
        .unwrap();

    let mut opts = options(true);
    opts.channel.compression = Some((CompressionKind::Zstd, 64));
    let (a, b) = Link::pair(MAX_PAYLOAD_SIZE);
    let (client, _server) = connect_over(
        a,
        b,
        opts.clone(),
        opts,
        ConnectionContext::default(),
        server_ctx,
    )
    .await;

    let note = Note {
        seq: 9,
        text: "abcd".repeat(4096),
    };
    client.send(&note).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), note);
}

/// Read frames from a raw link until one with `type_id` shows up.
async fn next_of_type(link: &mut Link, type_id: u16) -> Frame {
    loop {
        let frame = link.stream.next().await.unwrap().unwrap();
        if frame.type_id == type_id {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_unannounced_type_is_described_then_delivered() {
    let ctx = ConnectionContext::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    ctx.handlers
        .on::<Note, _>(&ctx.registry, move |note, _| {
            let _ = tx.send(note);
        })
        .unwrap();

    let (a, mut raw) = Link::pair(MAX_PAYLOAD_SIZE);
    let _conn = Connection::establish(a, Side::Acceptor, ctx, options(false))
        .await
        .unwrap();

    let note = Note {
        seq: 3,
        text: "held".into(),
    };
    let body = encode_packet(&note).unwrap();
    raw.sink
        .send(Frame::new(0x0200, Envelope::plain(body).to_bytes()))
        .await
        .unwrap();

    let describe = next_of_type(&mut raw, type_ids::DESCRIBE_TYPE).await;
    let envelope = Envelope::from_bytes(describe.payload).unwrap();
    assert_eq!(envelope.role, Role::Request);
    assert_eq!(
        ControlMessage::from_body(type_ids::DESCRIBE_TYPE, &envelope.body).unwrap(),
        ControlMessage::DescribeType { id: 0x0200 }
    );

    let reply = ControlMessage::TypeDescription {
        id: 0x0200,
        descriptor: Some(Note::descriptor()),
    };
    raw.sink
        .send(Frame::new(
            type_ids::TYPE_DESCRIPTION,
            Envelope::response(envelope.correlation_id, reply.to_body().unwrap()).to_bytes(),
        ))
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), note);
}

#[tokio::test]
async fn test_undescribable_type_closes_connection() {
    let (a, mut raw) = Link::pair(MAX_PAYLOAD_SIZE);
    let conn = Connection::establish(a, Side::Acceptor, ConnectionContext::default(), options(false))
        .await
        .unwrap();

    raw.sink
        .send(Frame::new(0x0300, Envelope::plain(vec![0, 0]).to_bytes()))
        .await
        .unwrap();
    let describe = next_of_type(&mut raw, type_ids::DESCRIBE_TYPE).await;
    let envelope = Envelope::from_bytes(describe.payload).unwrap();

    let reply = ControlMessage::TypeDescription {
        id: 0x0300,
        descriptor: None,
    };
    raw.sink
        .send(Frame::new(
            type_ids::TYPE_DESCRIPTION,
            Envelope::response(envelope.correlation_id, reply.to_body().unwrap()).to_bytes(),
        ))
        .await
        .unwrap();

    assert!(matches!(conn.closed().await, LostReason::Serialization(_)));
}

#[tokio::test]
async fn test_malformed_body_skipped_not_fatal() {
    let ctx = ConnectionContext::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    ctx.handlers
        .on::<Note, _>(&ctx.registry, move |note, _| {
            let _ = tx.send(note);
        })
        .unwrap();
    let (a, mut raw) = Link::pair(MAX_PAYLOAD_SIZE);
    let conn = Connection::establish(a, Side::Acceptor, ctx.clone(), options(false))
        .await
        .unwrap();

    let announce = ControlMessage::RegisterType {
        id: 0x0100,
        descriptor: Note::descriptor(),
    };
    raw.sink
        .send(Frame::new(
            type_ids::REGISTER_TYPE,
            Envelope::request(1, announce.to_body().unwrap()).to_bytes(),
        ))
        .await
        .unwrap();
    next_of_type(&mut raw, type_ids::REGISTER_TYPE_ACK).await;

    // truncated string length
    raw.sink
        .send(Frame::new(0x0100, Envelope::plain(vec![0, 2, 0, 0, 0, 1, 0, 0]).to_bytes()))
        .await
        .unwrap();
    let good = Note {
        seq: 2,
        text: "fine".into(),
    };
    raw.sink
        .send(Frame::new(
            0x0100,
            Envelope::plain(encode_packet(&good).unwrap()).to_bytes(),
        ))
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), good);
    assert!(conn.is_alive());
    assert_eq!(ctx.metrics.snapshot().protocol_errors, 1);
}

#[tokio::test]
async fn test_deeply_nested_announcement_fails_key_exchange() {
    use crate::protocol::message::tests::{nested_sequences, register_body};

    let (a, mut raw) = Link::pair(MAX_PAYLOAD_SIZE);
    let acceptor = tokio::spawn(Connection::establish(
        a,
        Side::Acceptor,
        ConnectionContext::default(),
        options(true),
    ));

    // allowed through before the key exchange, so no credentials are needed
    raw.sink
        .send(Frame::new(
            type_ids::REGISTER_TYPE,
            Envelope::request(1, register_body(0x0100, nested_sequences(16_000))).to_bytes(),
        ))
        .await
        .unwrap();

    let err = acceptor.await.unwrap().unwrap_err();
    assert!(
        matches!(err, ProtocolError::ConnectionLost(LostReason::Protocol(_))),
        "{err}"
    );
}

#[tokio::test]
async fn test_deeply_nested_description_closes_connection() {
    use crate::protocol::message::tests::{description_body, nested_sequences};

    let (a, mut raw) = Link::pair(MAX_PAYLOAD_SIZE);
    let conn = Connection::establish(a, Side::Acceptor, ConnectionContext::default(), options(false))
        .await
        .unwrap();

    let body = description_body(0x0300, nested_sequences(16_000));
    raw.sink
        .send(Frame::new(
            type_ids::TYPE_DESCRIPTION,
            Envelope::response(7, body).to_bytes(),
        ))
        .await
        .unwrap();

    assert!(matches!(conn.closed().await, LostReason::Protocol(_)));
}

#[tokio::test]
async fn test_close_returns_when_peer_stops_reading() {
    let (a, mut raw) = Link::pair(MAX_PAYLOAD_SIZE);
    let conn = Connection::establish(a, Side::Acceptor, ConnectionContext::default(), options(false))
        .await
        .unwrap();

    let sender = conn.clone();
    let filler = tokio::spawn(async move {
        let text = "x".repeat(32 * 1024);
        for seq in 0..300u32 {
            let note = Note {
                seq,
                text: text.clone(),
            };
            if sender.send(&note).await.is_err() {
                return seq;
            }
        }
        300
    });

    // acknowledge the announcement, then never read again
    let register = next_of_type(&mut raw, type_ids::REGISTER_TYPE).await;
    let envelope = Envelope::from_bytes(register.payload).unwrap();
    let ack = ControlMessage::RegisterTypeAck {
        id: 0x0100,
        accepted: true,
        reason: None,
    };
    raw.sink
        .send(Frame::new(
            type_ids::REGISTER_TYPE_ACK,
            Envelope::response(envelope.correlation_id, ack.to_body().unwrap()).to_bytes(),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!filler.is_finished(), "write queue should be full");

    tokio::time::timeout(Duration::from_secs(5), conn.close())
        .await
        .expect("close must not wait on a stalled peer");
    assert!(!conn.is_alive());
    assert_eq!(conn.lost_reason(), Some(LostReason::ClosedLocally));

    let sent = tokio::time::timeout(Duration::from_secs(5), filler)
        .await
        .expect("blocked senders are released")
        .unwrap();
    assert!(sent < 300);
    drop(raw);
}
