use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use gust_core::{GustError, Result};

/// How the aggregator turns per-client contributions into one series point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum WindowPolicy {
    /// Each point averages only the contributions since the previous point
    Windowed,
    /// Each point is the lifetime average of every contribution so far
    Cumulative,
}

/// Configuration for a single benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    pub run_name: String,
    pub clients: usize,
    pub endpoint: String,
    /// Clients subscribe through this endpoint when set
    pub relay_endpoint: Option<String>,
    pub scene: String,
    pub topic_prefix: String,
    pub metrics_topic: String,
    pub timeout: Duration,
    pub sample_interval: Duration,
    pub tick_interval: Duration,
    pub window_policy: WindowPolicy,
    pub convergence_window: usize,
    pub convergence_threshold: f64,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub grace_period: Duration,
    pub spawn_batch: usize,
    pub spawn_pause: Duration,
    pub output_dir: PathBuf,
}

pub const DEFAULT_CONVERGENCE_WINDOW: usize = 100;
pub const DEFAULT_CONVERGENCE_THRESHOLD: f64 = 0.00005;

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            run_name: "benchmark".to_string(),
            clients: 1,
            endpoint: "127.0.0.1:1883".to_string(),
            relay_endpoint: None,
            scene: random_scene(),
            topic_prefix: "realm/s".to_string(),
            metrics_topic: "cpu_mem".to_string(),
            timeout: Duration::from_secs(3 * 60),
            sample_interval: Duration::from_millis(100), // 10 Hz
            tick_interval: Duration::from_millis(100),   // 10 Hz
            window_policy: WindowPolicy::Windowed,
            convergence_window: DEFAULT_CONVERGENCE_WINDOW,
            convergence_threshold: DEFAULT_CONVERGENCE_THRESHOLD,
            connect_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(500),
            grace_period: Duration::from_secs(10),
            spawn_batch: 50,
            spawn_pause: Duration::from_secs(1),
            output_dir: PathBuf::from("data"),
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.clients == 0 {
            return Err(GustError::Config("client count must be > 0".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(GustError::Config("timeout must be > 0".to_string()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(GustError::Config("endpoint must not be empty".to_string()));
        }
        if matches!(&self.relay_endpoint, Some(relay) if relay.trim().is_empty()) {
            return Err(GustError::Config(
                "relay endpoint must not be empty when set".to_string(),
            ));
        }
        if self.sample_interval.is_zero() || self.tick_interval.is_zero() {
            return Err(GustError::Config(
                "sample and tick intervals must be > 0".to_string(),
            ));
        }
        if self.convergence_window == 0 {
            return Err(GustError::Config(
                "convergence window must be > 0".to_string(),
            ));
        }
        if self.scene.is_empty() || self.scene.contains(['#', '+', '/']) {
            return Err(GustError::Config(format!(
                "scene '{}' is not a single topic level",
                self.scene
            )));
        }
        Ok(())
    }

    /// Topic a client publishes its state updates to
    pub fn client_topic(&self, client: &str) -> String {
        format!("{}/{}/{}", self.topic_prefix, self.scene, client)
    }

    /// Filter every client subscribes to
    pub fn scene_filter(&self) -> String {
        format!("{}/{}/#", self.topic_prefix, self.scene)
    }
}

/// Fresh scene identifier scoping one run's topics
pub fn random_scene() -> String {
    format!("benchmark_{}", random_suffix(5))
}

pub(crate) fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}
