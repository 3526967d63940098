//! Shared gateway state, passed explicitly to every handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use wire::{BusClient, EngineHealthResponse};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::hub::ResultsHub;
use crate::signaling::SignalingRooms;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub nats_url: String,
    pub grpc_addr: String,
    pub http_addr: String,
    pub analyze_timeout: Duration,
    pub relay_timeout: Duration,
    pub engine_ping_ttl: Duration,
    pub breaker: BreakerConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let env = |key: &str, default: &str| {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        let env_u64 = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            nats_url: env("EYED_NATS_URL", "nats://127.0.0.1:4222"),
            grpc_addr: env("EYED_GRPC_ADDR", "0.0.0.0:50051"),
            http_addr: env("EYED_HTTP_ADDR", "0.0.0.0:8080"),
            analyze_timeout: Duration::from_secs(env_u64("EYED_ANALYZE_TIMEOUT_SECS", 10)),
            relay_timeout: Duration::from_secs(env_u64("EYED_RELAY_TIMEOUT_SECS", 30)),
            engine_ping_ttl: Duration::from_secs(5),
            breaker: BreakerConfig {
                failure_threshold: env_u64("EYED_BREAKER_THRESHOLD", 5) as u32,
                cooldown: Duration::from_secs(env_u64("EYED_BREAKER_COOLDOWN_SECS", 10)),
            },
        }
    }
}

/// Rolling counters for GetStatus / readiness.
pub struct GatewayStats {
    pub frames_processed: AtomicU64,
    avg_latency_ms: Mutex<Option<f64>>,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            frames_processed: AtomicU64::new(0),
            avg_latency_ms: Mutex::new(None),
        }
    }

    /// EWMA with 0.1 weight for new observations.
    pub fn observe_frame(&self, latency: Duration) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        let ms = latency.as_secs_f64() * 1_000.0;
        let mut avg = self.avg_latency_ms.lock();
        *avg = Some(match *avg {
            Some(current) => current * 0.9 + ms * 0.1,
            None => ms,
        });
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.avg_latency_ms.lock().unwrap_or(0.0)
    }
}

pub struct GatewayState {
    pub cfg: GatewayConfig,
    pub bus: BusClient,
    pub breaker: CircuitBreaker,
    pub hub: ResultsHub,
    pub rooms: SignalingRooms,
    pub stats: GatewayStats,
    /// Cached engine readiness ping.
    pub engine_ping: Mutex<Option<(Instant, EngineHealthResponse)>>,
}

impl GatewayState {
    pub fn new(cfg: GatewayConfig, bus: BusClient) -> Self {
        let breaker = CircuitBreaker::new(cfg.breaker.clone());
        Self {
            cfg,
            bus,
            breaker,
            hub: ResultsHub::new(),
            rooms: SignalingRooms::new(),
            stats: GatewayStats::new(),
            engine_ping: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_tracks_latency() {
        let stats = GatewayStats::new();
        assert_eq!(stats.avg_latency_ms(), 0.0);
        stats.observe_frame(Duration::from_millis(100));
        assert!((stats.avg_latency_ms() - 100.0).abs() < 1e-9);
        stats.observe_frame(Duration::from_millis(200));
        assert!((stats.avg_latency_ms() - 110.0).abs() < 1e-9);
        assert_eq!(stats.frames_processed.load(Ordering::Relaxed), 2);
    }
}
