//! Prometheus metrics for the speed hold session.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tacho_core::{FrequencyCell, SnapshotExchange};
use tiny_http::{Header, Response, Server};
use tracing::{error, info, warn};

const UPDATE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub measured_hz: Gauge,
    pub target_hz: Gauge,
    pub duty_percent: Gauge,
    /// Numeric phase code, see `ControlPhase::code`.
    pub phase: IntGauge,
    pub samples: IntCounter,
    pub rejected_edges: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let measured_hz = Gauge::new("tacho_measured_hz", "Filtered shaft frequency in Hz")?;
        let target_hz = Gauge::new("tacho_target_hz", "Target shaft frequency in Hz")?;
        let duty_percent = Gauge::new("tacho_duty_percent", "Commanded PWM duty in percent")?;
        let phase = IntGauge::new(
            "tacho_phase",
            "Controller phase (0=idle,1=calibrating,2=seeking,3=holding,4=ramping_down,5=stopped)",
        )?;
        let samples = IntCounter::new(
            "tacho_samples_total",
            "Frequency samples taken by the controller",
        )?;
        let rejected_edges = IntCounter::new(
            "tacho_rejected_edges_total",
            "Sensor edges rejected by the noise floor",
        )?;

        registry.register(Box::new(measured_hz.clone()))?;
        registry.register(Box::new(target_hz.clone()))?;
        registry.register(Box::new(duty_percent.clone()))?;
        registry.register(Box::new(phase.clone()))?;
        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(rejected_edges.clone()))?;

        Ok(Self {
            registry,
            measured_hz,
            target_hz,
            duty_percent,
            phase,
            samples,
            rejected_edges,
        })
    }

    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Serve `/metrics` and `/health` on a background thread.
pub fn serve_metrics(metrics: Metrics, bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to start metrics server");
                return;
            }
        };

        info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let response = match request.url() {
                "/metrics" => match metrics.encode() {
                    Ok(buffer) => {
                        let response = Response::from_data(buffer);
                        let header = Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        );
                        match header {
                            Ok(header) => response.with_header(header),
                            Err(()) => response,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to encode metrics");
                        Response::from_string("Internal Server Error").with_status_code(500)
                    }
                },
                "/health" => Response::from_string("OK"),
                _ => Response::from_string("Not Found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    })
}

/// Copy the latest control snapshot into the gauges until stopped.
pub fn start_metrics_updater(
    metrics: Metrics,
    exchange: Arc<SnapshotExchange>,
    frequency: Arc<FrequencyCell>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_sample_count = 0u64;
        let mut last_rejected = 0u64;
        while !stop.load(Ordering::Relaxed) {
            let snapshot = exchange.latest();
            metrics.measured_hz.set(f64::from(snapshot.measured_hz));
            metrics.target_hz.set(f64::from(snapshot.target_hz));
            metrics.duty_percent.set(f64::from(snapshot.duty_pct));
            metrics.phase.set(i64::from(snapshot.phase.code()));

            if snapshot.sample_count > last_sample_count {
                metrics.samples.inc_by(snapshot.sample_count - last_sample_count);
                last_sample_count = snapshot.sample_count;
            }
            let rejected = frequency.rejected_edges();
            if rejected > last_rejected {
                metrics.rejected_edges.inc_by(rejected - last_rejected);
                last_rejected = rejected;
            }

            thread::sleep(UPDATE_INTERVAL);
        }
    })
}
