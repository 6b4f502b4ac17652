//! The same packet exchange over the datagram transport.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::*;
use packet_link::service::secure::SecureState;
use packet_link::{Client, ConnectionEvent, LostReason, Server, TransportKind};

async fn udp_server(secure: bool) -> (Server, packet_link::NetworkConfig) {
    let mut config = test_config(secure);
    config.server.transports.tcp = false;
    config.server.transports.udp = true;
    let server = Server::bind(config.clone()).await.unwrap();
    server
        .on_request(|req: CalculationRequest, _conn| {
            Ok(CalculationResponse {
                result: req.x + req.y,
            })
        })
        .unwrap();
    assert!(server.local_addr(TransportKind::Tcp).is_none());
    let client_config = client_config_for(&server, &config, TransportKind::Udp);
    (server, client_config)
}

#[tokio::test]
async fn test_secure_request_over_udp() {
    let (server, config) = udp_server(true).await;
    let client = Client::connect(config).await.unwrap();

    let conn = client.current().unwrap();
    assert_eq!(conn.transport(), TransportKind::Udp);
    assert_eq!(conn.secure_state(), SecureState::Secured);

    let response: CalculationResponse = client
        .send_request(&CalculationRequest { x: 3, y: 4 })
        .await
        .unwrap();
    assert_eq!(response.result, 7);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_nested_packet_over_udp() {
    let (server, config) = udp_server(false).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    server
        .on(move |s: Student, _conn| {
            let _ = tx.send(s);
        })
        .unwrap();

    let client = Client::connect(config).await.unwrap();
    client.send(&student(7)).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), student(7));

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_udp_disconnect_is_seen_by_server() {
    let (server, config) = udp_server(true).await;
    let mut events = server.subscribe();
    let client = Client::connect(config).await.unwrap();

    match next_event(&mut events).await {
        ConnectionEvent::Established(conn) => assert_eq!(conn.transport(), TransportKind::Udp),
        other => panic!("expected Established, got {other:?}"),
    }

    client.close().await;
    match next_event(&mut events).await {
        ConnectionEvent::Lost { reason, transport, .. } => {
            assert_eq!(transport, TransportKind::Udp);
            assert_eq!(reason, LostReason::PeerClosed);
        }
        other => panic!("expected Lost, got {other:?}"),
    }

    server.shutdown().await;
}
