use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::WindowPolicy;

/// One point of the aggregated time series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub elapsed_secs: f64,
    pub avg_latency_ms: f64,
    pub avg_bytes_per_ms: Option<f64>,
    /// Client contributions that arrived since the previous point
    pub contributions: u64,
}

/// Counters a client hands over once, at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub dropped_on_connect: bool,
}

impl TerminalCounters {
    /// Counters of a client that never got a connection
    pub fn dropped() -> Self {
        Self {
            dropped_on_connect: true,
            ..Self::default()
        }
    }
}

/// Run-wide sums of every client's terminal counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub clients_reporting: u64,
    pub clients_dropped: u64,
}

impl MergedCounters {
    /// Fraction of own publishes that never came back, 0.0 when nothing was sent
    pub fn packet_loss(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_sent.saturating_sub(self.packets_received) as f64 / self.packets_sent as f64
    }
}

#[derive(Debug, Default)]
struct Window {
    latency_total: f64,
    latency_count: u64,
    bpms_total: f64,
    bpms_count: u64,
    // contributions since the last series point
    pending: u64,
}

/// Shared accumulator for cross-client latency and terminal counters.
///
/// The hot path (`contribute*`) only touches the window lock; the series is
/// appended by the control loop alone, and the merge store is only contended
/// at shutdown. No two of these locks are ever held at once.
#[derive(Debug)]
pub struct MetricsAggregator {
    policy: WindowPolicy,
    window: Mutex<Window>,
    series: Mutex<Vec<SeriesPoint>>,
    merged: Mutex<MergedCounters>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MetricsAggregator {
    pub fn new(policy: WindowPolicy) -> Self {
        Self {
            policy,
            window: Mutex::new(Window::default()),
            series: Mutex::new(Vec::new()),
            merged: Mutex::new(MergedCounters::default()),
        }
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    pub fn contribute_latency(&self, latency_ms: f64) {
        self.contribute(latency_ms, None);
    }

    pub fn contribute(&self, latency_ms: f64, bytes_per_ms: Option<f64>) {
        let mut window = lock(&self.window);
        window.latency_total += latency_ms;
        window.latency_count += 1;
        if let Some(bpms) = bytes_per_ms {
            window.bpms_total += bpms;
            window.bpms_count += 1;
        }
        window.pending += 1;
    }

    /// Close the current window and append its average, if anything arrived
    /// since the previous point.
    pub fn sample_series(&self, elapsed: Duration) -> Option<SeriesPoint> {
        let (avg_latency_ms, avg_bytes_per_ms, contributions) = {
            let mut window = lock(&self.window);
            if window.pending == 0 {
                return None;
            }
            let latency = window.latency_total / window.latency_count as f64;
            let bpms = (window.bpms_count > 0).then(|| window.bpms_total / window.bpms_count as f64);
            let contributions = window.pending;
            match self.policy {
                WindowPolicy::Windowed => *window = Window::default(),
                WindowPolicy::Cumulative => window.pending = 0,
            }
            (latency, bpms, contributions)
        };

        let mut series = lock(&self.series);
        let floor = series.last().map_or(0.0, |p| p.elapsed_secs);
        let point = SeriesPoint {
            elapsed_secs: elapsed.as_secs_f64().max(floor),
            avg_latency_ms,
            avg_bytes_per_ms,
            contributions,
        };
        series.push(point);
        Some(point)
    }

    pub fn series(&self) -> Vec<SeriesPoint> {
        lock(&self.series).clone()
    }

    pub fn series_len(&self) -> usize {
        lock(&self.series).len()
    }

    /// Average latencies of the last `n` points, oldest first
    pub fn recent(&self, n: usize) -> Vec<f64> {
        let series = lock(&self.series);
        let start = series.len().saturating_sub(n);
        series[start..].iter().map(|p| p.avg_latency_ms).collect()
    }

    pub fn merge_terminal(&self, counters: TerminalCounters) {
        let mut merged = lock(&self.merged);
        if counters.dropped_on_connect {
            merged.clients_dropped += 1;
            return;
        }
        merged.clients_reporting += 1;
        merged.bytes_sent += counters.bytes_sent;
        merged.bytes_received += counters.bytes_received;
        merged.packets_sent += counters.packets_sent;
        merged.packets_received += counters.packets_received;
    }

    pub fn merged(&self) -> MergedCounters {
        *lock(&self.merged)
    }
}
