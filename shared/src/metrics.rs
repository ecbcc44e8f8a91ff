use cadence::{Counted, Gauged, StatsdClient, Timed, UdpMetricSink};
pub use cadence::MetricError;
use parking_lot::Mutex;
use std::net::UdpSocket;
use std::sync::Arc;

/// Unit attached to an emitted metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    Count,
    Milliseconds,
    None,
}

/// One metric as captured by the recording backend.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub unit: MetricUnit,
}

enum MetricsBackend {
    Statsd(StatsdClient),
    Recording(Mutex<Vec<MetricEvent>>),
    Noop,
}

/// Cheap-to-clone metrics sink. Every component takes one at construction
/// instead of reaching for a process-wide metric object, so tests can swap
/// in the recording backend and assert on what was emitted.
#[derive(Clone)]
pub struct Metrics {
    backend: Arc<MetricsBackend>,
}

impl Metrics {
    /// Create a new Metrics client that sends to StatsD
    pub fn new(statsd_host: &str, statsd_port: u16, prefix: &str) -> Result<Self, MetricError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        let addr = format!("{}:{}", statsd_host, statsd_port);
        let sink = UdpMetricSink::from(addr, socket)?;
        let client = StatsdClient::from_sink(prefix, sink);

        Ok(Metrics {
            backend: Arc::new(MetricsBackend::Statsd(client)),
        })
    }

    /// Create a no-op Metrics client that discards all metrics
    pub fn new_noop() -> Self {
        Metrics {
            backend: Arc::new(MetricsBackend::Noop),
        }
    }

    /// Create a Metrics client that keeps every emitted metric in memory.
    pub fn new_recording() -> Self {
        Metrics {
            backend: Arc::new(MetricsBackend::Recording(Mutex::new(Vec::new()))),
        }
    }

    /// Emit one metric. Names are constructed at runtime by the callers;
    /// dashboards key off them verbatim.
    pub fn put_metric(&self, name: &str, value: f64, unit: MetricUnit) {
        match self.backend.as_ref() {
            MetricsBackend::Statsd(client) => {
                let result = match unit {
                    MetricUnit::Count => client.count(name, value as i64).map(|_| ()),
                    MetricUnit::Milliseconds => client.time(name, value as u64).map(|_| ()),
                    MetricUnit::None => client.gauge(name, value).map(|_| ()),
                };
                if let Err(e) = result {
                    eprintln!("Failed to send metric: {}", e);
                }
            }
            MetricsBackend::Recording(events) => {
                events.lock().push(MetricEvent {
                    name: name.to_string(),
                    value,
                    unit,
                });
            }
            MetricsBackend::Noop => {}
        }
    }

    /// Increment a counter metric by 1
    pub fn incr(&self, name: &str) {
        self.put_metric(name, 1.0, MetricUnit::Count);
    }

    /// Record a timing metric in milliseconds
    pub fn timing(&self, name: &str, value_ms: u64) {
        self.put_metric(name, value_ms as f64, MetricUnit::Milliseconds);
    }

    /// Everything captured so far. Empty unless this is a recording client.
    pub fn recorded(&self) -> Vec<MetricEvent> {
        match self.backend.as_ref() {
            MetricsBackend::Recording(events) => events.lock().clone(),
            _ => Vec::new(),
        }
    }

    /// Number of captured metrics whose name matches exactly.
    pub fn count_of(&self, name: &str) -> usize {
        self.recorded().iter().filter(|e| e.name == name).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_backend_captures_metrics() {
        let metrics = Metrics::new_recording();
        metrics.incr("requests_total");
        metrics.incr("requests_total");
        metrics.timing("request_latency", 42);

        assert_eq!(metrics.count_of("requests_total"), 2);
        let recorded = metrics.recorded();
        assert_eq!(recorded.len(), 3);
        assert_eq!(
            recorded[2],
            MetricEvent {
                name: "request_latency".to_string(),
                value: 42.0,
                unit: MetricUnit::Milliseconds,
            }
        );
    }

    #[test]
    fn test_noop_backend_records_nothing() {
        let metrics = Metrics::new_noop();
        metrics.incr("ignored");
        assert!(metrics.recorded().is_empty());
    }
}
