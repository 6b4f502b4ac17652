//! Chaos tests
//!
//! Clients reach the server through an in-process TCP proxy that can cut every link
//! at once or stall them silently, to check that in-flight requests always resolve
//! and the client recovers.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::*;
use futures::future::join_all;
use packet_link::{Client, ClientState, ConnectionEvent, LostReason, Server, TransportKind};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

#[derive(Clone, Copy, Debug)]
enum Fault {
    /// Drop both sockets of every proxied link
    Cut,
    /// Stop forwarding but keep the sockets open
    Stall,
}

struct Proxy {
    addr: String,
    faults: broadcast::Sender<Fault>,
}

impl Proxy {
    async fn start(upstream: String) -> Proxy {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (faults, _) = broadcast::channel(16);
        let tx = faults.clone();

        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let upstream = upstream.clone();
                let mut fault = tx.subscribe();
                tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(&upstream).await else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                        f = fault.recv() => {
                            if let Ok(Fault::Stall) = f {
                                // hold the sockets open until the test ends
                                let _held = (inbound, outbound);
                                std::future::pending::<()>().await;
                            }
                        }
                    }
                });
            }
        });
        Proxy { addr, faults }
    }

    fn inject(&self, fault: Fault) {
        let _ = self.faults.send(fault);
    }
}

async fn slow_adder(mut config: packet_link::NetworkConfig) -> (Server, packet_link::NetworkConfig, Proxy) {
    config.server.connection_timeout = Duration::from_millis(800);
    config.server.heartbeat_interval = Duration::from_millis(100);
    config.client.connection_timeout = Duration::from_millis(800);
    config.client.heartbeat_interval = Duration::from_millis(100);

    let server = Server::bind(config.clone()).await.unwrap();
    server
        .on_request(|req: CalculationRequest, _conn| {
            std::thread::sleep(Duration::from_millis(5));
            Ok(CalculationResponse {
                result: req.x + req.y,
            })
        })
        .unwrap();

    let proxy = Proxy::start(server.local_addr(TransportKind::Tcp).unwrap()).await;
    let mut client_config = config;
    client_config.client.address = proxy.addr.clone();
    (server, client_config, proxy)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_requests_resolve_when_link_is_cut() {
    let (server, config, proxy) = slow_adder(test_config(true)).await;
    let client = Client::new(config).unwrap();
    let mut events = client.subscribe();
    client.start().await.unwrap();
    let _ = next_event(&mut events).await;

    let requests = (0..50).map(|i| {
        let client = &client;
        async move {
            client
                .send_request_timeout::<_, CalculationResponse>(
                    &CalculationRequest { x: i, y: 1 },
                    Duration::from_secs(5),
                )
                .await
        }
    });
    let cut = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        proxy.inject(Fault::Cut);
    };
    let (results, ()) = timeout(Duration::from_secs(10), async {
        tokio::join!(join_all(requests), cut)
    })
    .await
    .expect("requests hung after the link was cut");

    // each request either completed or failed; none waited for the full timeout
    for (i, result) in results.into_iter().enumerate() {
        if let Ok(response) = result {
            assert_eq!(response.result, i as i32 + 1);
        }
    }

    match next_event(&mut events).await {
        ConnectionEvent::Lost { reason, .. } => assert!(!reason.is_security()),
        other => panic!("expected Lost, got {other:?}"),
    }
    match next_event(&mut events).await {
        ConnectionEvent::Established(_) => {}
        other => panic!("expected Established, got {other:?}"),
    }
    let response: CalculationResponse = client
        .send_request(&CalculationRequest { x: 40, y: 2 })
        .await
        .unwrap();
    assert_eq!(response.result, 42);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_stall_detected_by_timeout() {
    let (server, config, proxy) = slow_adder(test_config(false)).await;
    let mut server_events = server.subscribe();
    let client = Client::new(config).unwrap();
    let mut events = client.subscribe();
    client.start().await.unwrap();
    let _ = next_event(&mut events).await;
    let _ = next_event(&mut server_events).await;

    proxy.inject(Fault::Stall);

    match next_event(&mut events).await {
        ConnectionEvent::Lost { reason, .. } => assert_eq!(reason, LostReason::Timeout),
        other => panic!("expected Lost, got {other:?}"),
    }
    match next_event(&mut server_events).await {
        ConnectionEvent::Lost { reason, .. } => assert_eq!(reason, LostReason::Timeout),
        other => panic!("expected Lost, got {other:?}"),
    }

    // the proxy still accepts, so the client comes back on a fresh link
    match next_event(&mut events).await {
        ConnectionEvent::Established(_) => {}
        other => panic!("expected Established, got {other:?}"),
    }
    assert_eq!(client.state(), ClientState::Connected);

    client.close().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_cuts_never_leave_requests_pending() {
    let (server, config, proxy) = slow_adder(test_config(false)).await;
    let client = Client::connect(config).await.unwrap();

    for round in 0..3 {
        let conn = client.wait_connected(Duration::from_secs(5)).await.unwrap();
        let pending = (0..10).map(|i| {
            let conn = conn.clone();
            async move {
                conn.send_request::<_, CalculationResponse>(&CalculationRequest { x: i, y: round })
                    .await
            }
        });
        proxy.inject(Fault::Cut);
        timeout(Duration::from_secs(10), join_all(pending))
            .await
            .expect("requests hung across a cut");

        assert_eq!(conn.closed().await.to_string(), "transport closed");
        assert_eq!(conn.outstanding_requests(), 0);
    }

    client.close().await;
    server.shutdown().await;
}
