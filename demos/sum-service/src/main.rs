//! Sum service demo.
//!
//! Starts a TCP server with a couple of handlers, then exercises it with
//! a client on the same process: a unary call, a streaming call, and a
//! fire-and-forget event. Run with `RUST_LOG=debug` to watch the wire
//! traffic.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use stratus::prelude::*;
use tracing_subscriber::EnvFilter;

fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.on_request("sum", |data: Value| async move {
        let a = data["a"].as_i64().unwrap_or(0);
        let b = data["b"].as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });

    registry.on_request_stream("count_to", |data: Value| {
        let n = data.as_u64().unwrap_or(0);
        futures::stream::iter((1..=n).map(|i| Ok(json!(i))))
    });

    registry.on_event("user_created", |data: Value| async move {
        tracing::info!(user = %data, "user created");
        Ok(())
    });

    registry
}

#[tokio::main]
async fn main() -> Result<(), StratusError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = TcpServer::bind(
        TcpServerConfig::new().address("127.0.0.1", 0),
        Arc::new(build_registry()),
    )
    .await?;
    let addr = server.local_addr()?;
    tokio::spawn(server.run());
    println!("sum service listening on {addr}");

    let client = TcpClient::new(
        TcpClientConfig::new()
            .address("127.0.0.1", addr.port())
            .retry(RetryPolicy::new().attempts(3)),
    );

    // unary call
    let mut result = client.call("sum", json!({"a": 1, "b": 2})).await?;
    while let Some(value) = result.next().await {
        println!("sum(1, 2) = {}", value?);
    }

    // streaming call
    let mut counts = client.call("count_to", json!(5)).await?;
    while let Some(value) = counts.next().await {
        print!("{} ", value?);
    }
    println!();

    // fire-and-forget event; no response ever arrives
    client.emit("user_created", json!({"id": 42})).await?;

    // calls with no handler come back as remote errors, not disconnects
    let mut missing = client.call("product", json!({"a": 6, "b": 7})).await?;
    if let Some(Err(err)) = missing.next().await {
        println!("product: {err}");
    }

    client.close().await;
    Ok(())
}
