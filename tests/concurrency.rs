//! Many clients and tasks hammering one server at once.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bytes::BytesMut;
use common::*;
use packet_link::config::MAX_PAYLOAD_SIZE;
use packet_link::core::codec::FrameCodec;
use packet_link::core::frame::Frame;
use packet_link::{Client, Server, TransportKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::codec::{Decoder, Encoder};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_encode_decode_heavy() {
    let iterations = 20_000usize;
    let payload_sizes = [0usize, 64, 512, 4096, 65536];

    let mut tasks = JoinSet::new();
    for &size in &payload_sizes {
        tasks.spawn(async move {
            let mut codec = FrameCodec::new(MAX_PAYLOAD_SIZE);
            let mut buf = BytesMut::new();
            for i in 0..iterations {
                let frame = Frame::new(0x0100 + (i % 7) as u16, vec![((i + size) & 0xFF) as u8; size]);
                codec.encode(frame.clone(), &mut buf).unwrap();
                let decoded = codec.decode(&mut buf).unwrap().unwrap();
                assert_eq!(decoded, frame);
                assert!(buf.is_empty());
            }
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn many_clients_one_server() {
    const CLIENTS: usize = 16;
    const REQUESTS: i32 = 25;

    let config = test_config(true);
    let server = Server::bind(config.clone()).await.unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    server
        .on_request(move |req: CalculationRequest, _conn| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(CalculationResponse {
                result: req.x * req.y,
            })
        })
        .unwrap();
    let client_config = client_config_for(&server, &config, TransportKind::Tcp);

    let mut tasks = JoinSet::new();
    for c in 0..CLIENTS as i32 {
        let client_config = client_config.clone();
        tasks.spawn(async move {
            let client = Client::connect(client_config).await.unwrap();
            for r in 0..REQUESTS {
                let response: CalculationResponse = client
                    .send_request(&CalculationRequest { x: c, y: r })
                    .await
                    .unwrap();
                assert_eq!(response.result, c * r);
            }
            client.close().await;
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    assert_eq!(served.load(Ordering::Relaxed), CLIENTS * REQUESTS as usize);
    let metrics = server.metrics().snapshot();
    assert_eq!(metrics.connections_established, CLIENTS as u64);
    assert_eq!(metrics.handshakes_success, CLIENTS as u64);

    server.shutdown().await;
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_sends_announce_once() {
    let config = test_config(false);
    let server = Server::bind(config.clone()).await.unwrap();
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    server
        .on(move |_s: Student, _conn| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    let client = Arc::new(
        Client::connect(client_config_for(&server, &config, TransportKind::Tcp))
            .await
            .unwrap(),
    );

    // every task races to be the first sender of a never-announced type
    let mut tasks = JoinSet::new();
    for id in 0..32 {
        let client = Arc::clone(&client);
        tasks.spawn(async move { client.send(&student(id)).await.unwrap() });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while received.load(Ordering::Relaxed) < 32 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(received.load(Ordering::Relaxed), 32);
    assert_eq!(client.metrics().snapshot().registrations_sent, 1);
    assert_eq!(server.metrics().snapshot().registrations_accepted, 1);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unfinished_handshakes_count_toward_limit() {
    let mut config = test_config(true);
    config.server.max_connections = 2;
    let server = Server::bind(config.clone()).await.unwrap();
    let client_config = client_config_for(&server, &config, TransportKind::Tcp);
    let address = client_config.client.address.clone();

    // connect and never start the key exchange
    let mut stalled = Vec::new();
    for _ in 0..2 {
        stalled.push(tokio::net::TcpStream::connect(&address).await.unwrap());
    }
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    assert!(Client::connect(client_config.clone()).await.is_err());
    assert_eq!(server.connection_count(), 0);

    drop(stalled);
    let client = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            match Client::connect(client_config.clone()).await {
                Ok(client) => break client,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("slots are released once the stalled setups fail");
    assert_eq!(server.connection_count(), 1);

    client.close().await;
    server.shutdown().await;
}
