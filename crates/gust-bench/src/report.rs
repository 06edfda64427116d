use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use gust_core::{GustError, Result};

use crate::listener::mean;
use crate::{MergedCounters, SeriesPoint, SystemSamples, Verdict, WindowPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Headline numbers of a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Mean of the trailing window of the average-latency series
    pub latency_ms: Option<f64>,
    pub bytes_per_ms_sent: f64,
    pub bytes_per_ms_received: f64,
    pub dropped_clients: u64,
    pub reporting_clients: u64,
    /// Fraction in [0, 1]
    pub packet_loss: f64,
    pub mean_cpu: Option<f64>,
    pub mean_mem: Option<f64>,
    pub percentiles: Option<LatencyPercentiles>,
}

/// Everything persisted about one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_name: String,
    pub scene: String,
    pub endpoint: String,
    pub clients: usize,
    pub window_policy: WindowPolicy,
    pub trailing_window: usize,
    pub verdict: Verdict,
    pub elapsed_secs: f64,
    pub times: Vec<f64>,
    pub avg_latencies: Vec<f64>,
    pub avg_bytes_per_ms: Vec<Option<f64>>,
    pub counters: MergedCounters,
    pub system: SystemSamples,
    pub summary: RunSummary,
}

pub struct RunReportParts {
    pub run_name: String,
    pub scene: String,
    pub endpoint: String,
    pub clients: usize,
    pub window_policy: WindowPolicy,
    pub trailing_window: usize,
    pub verdict: Verdict,
    pub elapsed_secs: f64,
    pub series: Vec<SeriesPoint>,
    pub counters: MergedCounters,
    pub system: SystemSamples,
}

impl RunReport {
    pub fn new(parts: RunReportParts) -> Self {
        let mut report = Self {
            run_name: parts.run_name,
            scene: parts.scene,
            endpoint: parts.endpoint,
            clients: parts.clients,
            window_policy: parts.window_policy,
            trailing_window: parts.trailing_window,
            verdict: parts.verdict,
            elapsed_secs: parts.elapsed_secs,
            times: parts.series.iter().map(|p| p.elapsed_secs).collect(),
            avg_latencies: parts.series.iter().map(|p| p.avg_latency_ms).collect(),
            avg_bytes_per_ms: parts.series.iter().map(|p| p.avg_bytes_per_ms).collect(),
            counters: parts.counters,
            system: parts.system,
            summary: RunSummary {
                latency_ms: None,
                bytes_per_ms_sent: 0.0,
                bytes_per_ms_received: 0.0,
                dropped_clients: 0,
                reporting_clients: 0,
                packet_loss: 0.0,
                mean_cpu: None,
                mean_mem: None,
                percentiles: None,
            },
        };
        report.summary = report.compute_summary();
        report
    }

    /// The last `trailing_window` points of the average-latency series
    pub fn trailing_latencies(&self) -> &[f64] {
        let start = self.avg_latencies.len().saturating_sub(self.trailing_window);
        &self.avg_latencies[start..]
    }

    pub fn compute_summary(&self) -> RunSummary {
        let elapsed_ms = self.elapsed_secs * 1000.0;
        let per_ms = |bytes: u64| {
            if elapsed_ms > 0.0 {
                bytes as f64 / elapsed_ms
            } else {
                0.0
            }
        };

        RunSummary {
            latency_ms: mean(self.trailing_latencies()),
            bytes_per_ms_sent: per_ms(self.counters.bytes_sent),
            bytes_per_ms_received: per_ms(self.counters.bytes_received),
            dropped_clients: self.counters.clients_dropped,
            reporting_clients: self.counters.clients_reporting,
            packet_loss: self.counters.packet_loss(),
            mean_cpu: self.system.mean_cpu(),
            mean_mem: self.system.mean_mem(),
            percentiles: percentiles(&self.avg_latencies),
        }
    }

    pub fn artifact_path(dir: &Path, run_name: &str) -> PathBuf {
        dir.join(format!("time_vs_lat_{}.json", run_name))
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = Self::artifact_path(dir, &self.run_name);
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn print(&self) {
        let s = &self.summary;
        println!("\n=== Run '{}' ({} clients) ===", self.run_name, self.clients);
        println!("Endpoint: {}", self.endpoint);
        println!("Scene: {}", self.scene);
        println!("Stopped by: {:?} after {:.2}s", self.verdict, self.elapsed_secs);
        println!("Series points: {}", self.avg_latencies.len());
        match s.latency_ms {
            Some(latency) => println!("  {:.3} ms response time", latency),
            None => println!("  no latency samples"),
        }
        println!(
            "  {:.3} bytes/ms sent | {:.3} bytes/ms received",
            s.bytes_per_ms_sent, s.bytes_per_ms_received
        );
        println!(
            "  {} clients dropped | {:.2}% packet loss",
            s.dropped_clients,
            s.packet_loss * 100.0
        );
        println!(
            "  {} cpu usage | {} mem usage",
            percent_or_na(s.mean_cpu),
            percent_or_na(s.mean_mem)
        );
        if let Some(p) = s.percentiles {
            println!("Average latency distribution (ms):");
            println!("  p50:  {:.3}", p.p50_ms);
            println!("  p95:  {:.3}", p.p95_ms);
            println!("  p99:  {:.3}", p.p99_ms);
            println!("  Max:  {:.3}", p.max_ms);
        }
    }
}

fn percent_or_na(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.1}%", v * 100.0))
}

/// Percentiles of a latency series at microsecond resolution
pub fn percentiles(latencies_ms: &[f64]) -> Option<LatencyPercentiles> {
    if latencies_ms.is_empty() {
        return None;
    }
    let mut histogram = Histogram::<u64>::new(3).ok()?;
    for latency in latencies_ms {
        let us = (latency * 1000.0).round().max(0.0) as u64;
        histogram.saturating_record(us);
    }
    let ms = |us: u64| us as f64 / 1000.0;
    Some(LatencyPercentiles {
        p50_ms: ms(histogram.value_at_quantile(0.50)),
        p95_ms: ms(histogram.value_at_quantile(0.95)),
        p99_ms: ms(histogram.value_at_quantile(0.99)),
        max_ms: ms(histogram.max()),
    })
}

/// Per-population results of a sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub name: String,
    pub max_clients: usize,
    pub step: usize,
    pub clients: Vec<usize>,
    pub avg_lats: Vec<Vec<f64>>,
    pub bpms_sent: Vec<f64>,
    pub bpms_recvd: Vec<f64>,
    pub dropped_clients: Vec<u64>,
    pub dropped_packets_percent: Vec<f64>,
    pub cpu: Vec<Option<f64>>,
    pub mem: Vec<Option<f64>>,
}

impl SweepReport {
    pub fn new(name: &str, max_clients: usize, step: usize) -> Self {
        Self {
            name: name.to_string(),
            max_clients,
            step,
            ..Self::default()
        }
    }

    pub fn push(&mut self, report: &RunReport) {
        let s = &report.summary;
        self.clients.push(report.clients);
        self.avg_lats.push(report.trailing_latencies().to_vec());
        self.bpms_sent.push(s.bytes_per_ms_sent);
        self.bpms_recvd.push(s.bytes_per_ms_received);
        self.dropped_clients.push(s.dropped_clients);
        self.dropped_packets_percent.push(s.packet_loss);
        self.cpu.push(s.mean_cpu);
        self.mem.push(s.mean_mem);
    }

    pub fn artifact_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!(
            "sweep_{}_c{}_i{}.json",
            self.name, self.max_clients, self.step
        ))
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = self.artifact_path(dir);
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(GustError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(latencies: &[f64]) -> RunReportParts {
        RunReportParts {
            run_name: "unit".to_string(),
            scene: "benchmark_abcde".to_string(),
            endpoint: "loopback".to_string(),
            clients: 2,
            window_policy: WindowPolicy::Windowed,
            trailing_window: 3,
            verdict: Verdict::StopTimeout,
            elapsed_secs: 2.0,
            series: latencies
                .iter()
                .enumerate()
                .map(|(i, l)| SeriesPoint {
                    elapsed_secs: i as f64 * 0.1,
                    avg_latency_ms: *l,
                    avg_bytes_per_ms: Some(100.0),
                    contributions: 2,
                })
                .collect(),
            counters: MergedCounters {
                bytes_sent: 4000,
                bytes_received: 3000,
                packets_sent: 40,
                packets_received: 30,
                clients_reporting: 2,
                clients_dropped: 1,
            },
            system: SystemSamples {
                cpu: vec![0.2, 0.4],
                mem: vec![0.1, 0.1],
            },
        }
    }

    #[test]
    fn test_summary_accessors() {
        let report = RunReport::new(parts(&[10.0, 1.0, 2.0, 3.0]));
        let s = report.summary;

        assert_eq!(report.trailing_latencies(), &[1.0, 2.0, 3.0]);
        assert_eq!(s.latency_ms, Some(2.0));
        assert_eq!(s.bytes_per_ms_sent, 2.0);
        assert_eq!(s.bytes_per_ms_received, 1.5);
        assert_eq!(s.dropped_clients, 1);
        assert_eq!(s.reporting_clients, 2);
        assert!((s.packet_loss - 0.25).abs() < 1e-12);
        assert!((s.mean_cpu.unwrap() - 0.3).abs() < 1e-12);
        // HDR buckets above 2048us are a few microseconds wide
        assert!((s.percentiles.unwrap().max_ms - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_empty_series_has_no_latency() {
        let report = RunReport::new(parts(&[]));
        assert_eq!(report.summary.latency_ms, None);
        assert_eq!(report.summary.percentiles, None);
    }

    #[test]
    fn test_percentiles_at_microsecond_resolution() {
        let p = percentiles(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((p.p50_ms - 2.0).abs() < 0.01);
        assert!((p.p99_ms - 4.0).abs() < 0.01);
        assert!((p.max_ms - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_artifact_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let report = RunReport::new(parts(&[1.0, 2.0]));
        let path = report.save(dir.path()).unwrap();

        assert_eq!(path, dir.path().join("time_vs_lat_unit.json"));
        let loaded = RunReport::load(&path).unwrap();
        assert_eq!(loaded.run_name, report.run_name);
        assert_eq!(loaded.verdict, Verdict::StopTimeout);
        assert_eq!(loaded.avg_latencies, vec![1.0, 2.0]);
        assert_eq!(loaded.times.len(), 2);
        assert_eq!(loaded.counters, report.counters);
        assert_eq!(loaded.summary.dropped_clients, 1);
        assert!((loaded.summary.packet_loss - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_sweep_report_collects_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut sweep = SweepReport::new("s", 3, 2);
        sweep.push(&RunReport::new(parts(&[1.0, 2.0, 3.0, 4.0])));

        assert_eq!(sweep.avg_lats, vec![vec![2.0, 3.0, 4.0]]);
        assert_eq!(sweep.dropped_clients, vec![1]);
        let path = sweep.save(dir.path()).unwrap();
        assert!(path.ends_with("sweep_s_c3_i2.json"));
        let loaded = SweepReport::load(&path).unwrap();
        assert_eq!(loaded.clients, vec![2]);
        assert_eq!(loaded.avg_lats, sweep.avg_lats);
    }
}
