//! Example: request/response over a secured TCP link
//!
//! Starts a server and a client in one process, asks the server to add two numbers
//! and prints the counters of both sides.
//!
//! Run with: `cargo run --example calculation`

use packet_link::utils::logging::init_logging;
use packet_link::{Client, FieldKind, NetworkConfig, Packet, Schema, Server, TransportKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct CalculationRequest {
    x: i32,
    y: i32,
}

impl Packet for CalculationRequest {
    const NAME: &'static str = "demo.CalculationRequest";

    fn schema() -> Schema {
        Schema::new().field("x", FieldKind::I32).field("y", FieldKind::I32)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CalculationResponse {
    result: i32,
}

impl Packet for CalculationResponse {
    const NAME: &'static str = "demo.CalculationResponse";

    fn schema() -> Schema {
        Schema::new().field("result", FieldKind::I32)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NetworkConfig::from_env()?;
    config.server.address = "127.0.0.1:0".into();
    init_logging(&config.logging)?;

    let server = Server::bind(config.clone()).await?;
    server.on_request(|req: CalculationRequest, conn| {
        println!("server: {} + {} from {}", req.x, req.y, conn.remote());
        Ok(CalculationResponse {
            result: req.x + req.y,
        })
    })?;

    config.client.address = server
        .local_addr(TransportKind::Tcp)
        .ok_or("server has no TCP listener")?;
    let client = Client::connect(config).await?;

    let response: CalculationResponse = client
        .send_request(&CalculationRequest { x: 3, y: 4 })
        .await?;
    println!("client: 3 + 4 = {}", response.result);

    client.close().await;
    server.shutdown().await;

    println!("client metrics: {:?}", client.metrics().snapshot());
    println!("server metrics: {:?}", server.metrics().snapshot());
    Ok(())
}
