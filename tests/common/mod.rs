//! Shared packet fixtures and configuration for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use packet_link::config::NetworkConfig;
use packet_link::{ConnectionEvent, FieldKind, Packet, Schema, Server, TransportKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationRequest {
    pub x: i32,
    pub y: i32,
}

impl Packet for CalculationRequest {
    const NAME: &'static str = "demo.CalculationRequest";

    fn schema() -> Schema {
        Schema::new().field("x", FieldKind::I32).field("y", FieldKind::I32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResponse {
    pub result: i32,
}

impl Packet for CalculationResponse {
    const NAME: &'static str = "demo.CalculationResponse";

    fn schema() -> Schema {
        Schema::new().field("result", FieldKind::I32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub zip: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: u64,
    pub name: String,
    pub grades: Vec<f64>,
    pub enrolled: bool,
    pub address: Address,
    pub avatar: Vec<u8>,
}

impl Packet for Student {
    const NAME: &'static str = "demo.Student";

    fn schema() -> Schema {
        Schema::new()
            .field("id", FieldKind::U64)
            .field("name", FieldKind::String)
            .field("grades", FieldKind::sequence(FieldKind::F64))
            .field("enrolled", FieldKind::Bool)
            .field(
                "address",
                FieldKind::Object(
                    Schema::new()
                        .field("street", FieldKind::String)
                        .field("zip", FieldKind::optional(FieldKind::U32)),
                ),
            )
            .field("avatar", FieldKind::Bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub text: String,
}

impl Packet for Announcement {
    const NAME: &'static str = "demo.Announcement";

    fn schema() -> Schema {
        Schema::new().field("text", FieldKind::String)
    }
}

pub fn student(id: u64) -> Student {
    Student {
        id,
        name: format!("student-{id}"),
        grades: vec![3.5, 4.0, 2.25],
        enrolled: id % 2 == 0,
        address: Address {
            street: "1 Main St".into(),
            zip: Some(12345),
        },
        avatar: vec![0xDE, 0xAD, 0xBE, 0xEF],
    }
}

/// Ephemeral ports and short timers so tests finish quickly.
pub fn test_config(secure: bool) -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".into();
        c.server.udp_address = "127.0.0.1:0".into();
        c.server.heartbeat_interval = Duration::from_millis(200);
        c.server.connection_timeout = Duration::from_secs(3);
        c.server.request_timeout = Duration::from_secs(5);
        c.server.shutdown_timeout = Duration::from_secs(1);
        c.client.heartbeat_interval = Duration::from_millis(200);
        c.client.connection_timeout = Duration::from_secs(3);
        c.client.response_timeout = Duration::from_secs(5);
        c.client.reconnect_delay = Duration::from_millis(50);
        c.client.max_reconnect_delay = Duration::from_millis(500);
        c.transport.encryption_enabled = secure;
        c.transport.sign_frames = secure;
    })
}

/// Client config pointing at the server's bound address for `kind`.
pub fn client_config_for(server: &Server, base: &NetworkConfig, kind: TransportKind) -> NetworkConfig {
    let mut config = base.clone();
    config.client.transport = kind;
    config.client.address = server.local_addr(kind).expect("transport not bound");
    config
}

pub async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event within 5s")
        .expect("event channel closed")
}
