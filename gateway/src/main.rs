//! Gateway
//!
//! Front door of the platform: gRPC frame ingress behind a circuit
//! breaker, REST relays onto the bus, live result fan-out over
//! WebSockets and the WebRTC signaling relay.

mod breaker;
mod grpc;
mod hub;
mod rest;
mod signaling;
mod state;

pub mod capture {
    tonic::include_proto!("eyed.capture");
}

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wire::{subjects, AnalyzeResult, BusClient};

use capture::capture_service_server::CaptureServiceServer;
use grpc::CaptureServiceImpl;
use state::{GatewayConfig, GatewayState};

/// Connect to the bus with bounded retries; a gateway without its bus is
/// a fatal misconfiguration.
async fn connect_bus(url: &str) -> Option<BusClient> {
    let mut backoff = Duration::from_millis(500);
    for attempt in 1..=5 {
        match BusClient::connect(url).await {
            Ok(bus) => {
                info!("bus connected: {url}");
                return Some(bus);
            }
            Err(e) => {
                warn!("bus connect attempt {attempt}/5 failed: {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
        }
    }
    None
}

/// Long-lived subscriber: every bus result goes to every WS client.
async fn run_result_fanout(state: Arc<GatewayState>) {
    loop {
        let mut sub = match state.bus.subscribe(subjects::RESULT).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("result subscription failed: {e}, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        info!("subscribed to {}", subjects::RESULT);
        while let Some(msg) = sub.next().await {
            match serde_json::from_slice::<AnalyzeResult>(&msg.payload) {
                Ok(_) => {
                    let body = String::from_utf8_lossy(&msg.payload);
                    state.hub.broadcast(&body);
                }
                Err(e) => warn!("dropping malformed result message: {e}"),
            }
        }
        warn!("result subscription ended, resubscribing");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EYED_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = GatewayConfig::from_env();
    info!(
        "gateway starting: grpc={} http={} bus={}",
        cfg.grpc_addr, cfg.http_addr, cfg.nats_url
    );

    let Some(bus) = connect_bus(&cfg.nats_url).await else {
        error!("bus unreachable after retries, exiting");
        std::process::exit(1);
    };

    let state = Arc::new(GatewayState::new(cfg.clone(), bus));

    let fanout = tokio::spawn(run_result_fanout(state.clone()));

    // gRPC ingress.
    let grpc_addr = match cfg.grpc_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("bad gRPC address {}: {e}", cfg.grpc_addr);
            std::process::exit(1);
        }
    };
    let grpc_state = state.clone();
    let grpc_server = tokio::spawn(async move {
        Server::builder()
            .add_service(CaptureServiceServer::new(CaptureServiceImpl::new(grpc_state)))
            .serve(grpc_addr)
            .await
    });

    // HTTP surface.
    let app = rest::router(state.clone());
    let listener = match tokio::net::TcpListener::bind(&cfg.http_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind {}: {e}", cfg.http_addr);
            std::process::exit(1);
        }
    };
    let http_server = tokio::spawn(async move { axum::serve(listener, app).await });

    info!("gateway ready");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("signal handler failed: {e}"),
    }

    fanout.abort();
    grpc_server.abort();
    http_server.abort();
    state.bus.flush().await;
    info!("gateway stopped");
}
