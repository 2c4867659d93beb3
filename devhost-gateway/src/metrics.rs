use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Number of latency samples retained for percentile calculation.
const LATENCY_SAMPLES: usize = 1000;

/// Per-request metrics for the gateway.
///
/// Counters are lock-free; the latency ring takes a short mutex on record
/// and snapshot only.
pub struct GatewayMetrics {
    started_at: Instant,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    in_flight: AtomicI64,
    ws_active: AtomicI64,
    ws_total: AtomicU64,
    ssrf_blocks: DashMap<&'static str, u64>,
    latencies: Mutex<LatencyRing>,
}

struct LatencyRing {
    samples: Vec<f64>,
    next: usize,
}

impl LatencyRing {
    fn record(&mut self, ms: f64) {
        if self.samples.len() < LATENCY_SAMPLES {
            self.samples.push(ms);
        } else {
            self.samples[self.next] = ms;
            self.next = (self.next + 1) % LATENCY_SAMPLES;
        }
    }

    fn percentiles(&self) -> (f64, f64, f64) {
        if self.samples.is_empty() {
            return (0.0, 0.0, 0.0);
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let pick = |p: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[idx]
        };
        (pick(0.50), pick(0.95), pick(0.99))
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            ws_active: AtomicI64::new(0),
            ws_total: AtomicU64::new(0),
            ssrf_blocks: DashMap::new(),
            latencies: Mutex::new(LatencyRing {
                samples: Vec::with_capacity(LATENCY_SAMPLES),
                next: 0,
            }),
        }
    }

    /// Record a finished request.
    pub fn record_request(&self, status: u16, latency_ms: f64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if status >= 400 {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.latencies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(latency_ms);
    }

    pub fn record_ssrf_block(&self, reason: &'static str) {
        *self.ssrf_blocks.entry(reason).or_insert(0) += 1;
    }

    /// RAII slot in the in-flight counter. Owning, so a suspended request
    /// keeps its slot while its response body is still streaming.
    pub fn in_flight_guard(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: Arc::clone(self),
        }
    }

    /// RAII WebSocket gauge: active while held, cumulative on drop.
    pub fn ws_guard(self: &Arc<Self>) -> WsGuard {
        self.ws_active.fetch_add(1, Ordering::Relaxed);
        WsGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95, p99) = self
            .latencies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .percentiles();
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            requests: RequestCounters {
                total: self.requests_total.load(Ordering::Relaxed),
                errors: self.errors_total.load(Ordering::Relaxed),
                in_flight: self.in_flight(),
            },
            latency_ms: LatencyPercentiles { p50, p95, p99 },
            websockets: WsCounters {
                active: self.ws_active.load(Ordering::Relaxed),
                total: self.ws_total.load(Ordering::Relaxed),
            },
            ssrf_blocks: self
                .ssrf_blocks
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InFlightGuard {
    metrics: Arc<GatewayMetrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct WsGuard {
    metrics: Arc<GatewayMetrics>,
}

impl Drop for WsGuard {
    fn drop(&mut self) {
        self.metrics.ws_active.fetch_sub(1, Ordering::Relaxed);
        self.metrics.ws_total.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub requests: RequestCounters,
    pub latency_ms: LatencyPercentiles,
    pub websockets: WsCounters,
    pub ssrf_blocks: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct RequestCounters {
    pub total: u64,
    pub errors: u64,
    pub in_flight: i64,
}

#[derive(Debug, Serialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Serialize)]
pub struct WsCounters {
    pub active: i64,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_requests_and_errors() {
        let m = GatewayMetrics::new();
        m.record_request(200, 1.2);
        m.record_request(404, 0.3);
        m.record_request(502, 5.0);
        let snap = m.snapshot();
        assert_eq!(snap.requests.total, 3);
        assert_eq!(snap.requests.errors, 2);
    }

    #[test]
    fn in_flight_guard_is_raii() {
        let m = Arc::new(GatewayMetrics::new());
        {
            let _a = m.in_flight_guard();
            let _b = m.in_flight_guard();
            assert_eq!(m.in_flight(), 2);
        }
        assert_eq!(m.in_flight(), 0);
    }

    #[test]
    fn ws_guard_tracks_active_and_total() {
        let m = Arc::new(GatewayMetrics::new());
        {
            let _ws = m.ws_guard();
            let snap = m.snapshot();
            assert_eq!(snap.websockets.active, 1);
            assert_eq!(snap.websockets.total, 0);
        }
        let snap = m.snapshot();
        assert_eq!(snap.websockets.active, 0);
        assert_eq!(snap.websockets.total, 1);
    }

    #[test]
    fn ssrf_blocks_break_down_by_reason() {
        let m = GatewayMetrics::new();
        m.record_ssrf_block("metadata_endpoint");
        m.record_ssrf_block("metadata_endpoint");
        m.record_ssrf_block("private_network");
        let snap = m.snapshot();
        assert_eq!(snap.ssrf_blocks["metadata_endpoint"], 2);
        assert_eq!(snap.ssrf_blocks["private_network"], 1);
    }

    #[test]
    fn percentiles_over_known_distribution() {
        let m = GatewayMetrics::new();
        for i in 1..=100 {
            m.record_request(200, i as f64);
        }
        let snap = m.snapshot();
        assert!((snap.latency_ms.p50 - 50.0).abs() <= 1.0);
        assert!((snap.latency_ms.p95 - 95.0).abs() <= 1.0);
        assert!((snap.latency_ms.p99 - 99.0).abs() <= 1.0);
    }

    #[test]
    fn ring_is_bounded() {
        let m = GatewayMetrics::new();
        for i in 0..2500 {
            m.record_request(200, i as f64);
        }
        let ring = m.latencies.lock().unwrap();
        assert_eq!(ring.samples.len(), LATENCY_SAMPLES);
    }
}
