use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use gust_client::Transport;
use gust_core::Result;

use crate::{
    run_camera, AutoConfirm, BenchConfig, Camera, CameraLinks, CameraOutcome, CameraTiming,
    Confirmer, MetricsAggregator, MetricsListener, PolicyInput, RunReport, RunReportParts,
    ShutdownToken, StartGate, TerminationPolicy, Verdict,
};

/// Lifecycle of one benchmark run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Spawning,
    Running,
    Draining,
    Merged,
    Reported,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub artifact: PathBuf,
}

/// Owns the client population for one run, from spawn to persisted report
pub struct Orchestrator {
    config: BenchConfig,
    transport: Arc<dyn Transport>,
    relay: Option<Arc<dyn Transport>>,
    metrics: Option<Arc<dyn Transport>>,
    confirmer: Arc<dyn Confirmer>,
    token: ShutdownToken,
    aggregator: Arc<MetricsAggregator>,
    state: RunState,
}

impl Orchestrator {
    pub fn new(config: BenchConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let aggregator = Arc::new(MetricsAggregator::new(config.window_policy));

        Ok(Self {
            config,
            transport,
            relay: None,
            metrics: None,
            // Unattended unless a prompt is attached
            confirmer: Arc::new(AutoConfirm(true)),
            token: ShutdownToken::new(),
            aggregator,
            state: RunState::Created,
        })
    }

    /// Subscribe through a second endpoint to measure broker-to-broker forwarding
    pub fn with_relay(mut self, relay: Arc<dyn Transport>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Listen for system samples on a different endpoint than the clients use
    pub fn with_metrics_transport(mut self, metrics: Arc<dyn Transport>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }

    pub fn aggregator(&self) -> Arc<MetricsAggregator> {
        self.aggregator.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub async fn run(&mut self) -> Result<RunOutcome> {
        info!(
            "Starting run '{}': {} clients against {} (scene {})",
            self.config.run_name,
            self.config.clients,
            self.transport.describe(),
            self.config.scene
        );

        self.transition(RunState::Spawning);
        let listener = MetricsListener::spawn(
            self.metrics.clone().unwrap_or_else(|| self.transport.clone()),
            format!("cpu_mem_log_{}", self.config.scene),
            self.config.metrics_topic.clone(),
        );
        let gate = StartGate::new();
        let workers = self.spawn_workers(&gate).await;

        self.transition(RunState::Running);
        gate.release();
        info!("Start barrier released for {} clients", workers.len());
        let started = Instant::now();
        let verdict = self.control_loop(started).await;
        let elapsed = started.elapsed();

        self.transition(RunState::Draining);
        self.token.confirm();
        self.drain(workers).await;
        let system = listener.stop().await;

        self.transition(RunState::Merged);
        let counters = self.aggregator.merged();
        let report = RunReport::new(RunReportParts {
            run_name: self.config.run_name.clone(),
            scene: self.config.scene.clone(),
            endpoint: self.transport.describe(),
            clients: self.config.clients,
            window_policy: self.config.window_policy,
            trailing_window: self.config.convergence_window,
            verdict,
            elapsed_secs: elapsed.as_secs_f64(),
            series: self.aggregator.series(),
            counters,
            system,
        });

        let artifact = report.save(&self.config.output_dir)?;
        self.transition(RunState::Reported);
        info!("Results written to {}", artifact.display());

        Ok(RunOutcome { report, artifact })
    }

    fn transition(&mut self, next: RunState) {
        debug!(
            "Run '{}': {:?} -> {:?}",
            self.config.run_name, self.state, next
        );
        self.state = next;
    }

    async fn spawn_workers(&self, gate: &StartGate) -> Vec<JoinHandle<CameraOutcome>> {
        let links = CameraLinks {
            publish: self.transport.clone(),
            subscribe: self.relay.clone(),
            filter: self.config.scene_filter(),
        };
        let timing = CameraTiming {
            tick_interval: self.config.tick_interval,
            connect_timeout: self.config.connect_timeout,
            drain_timeout: self.config.drain_timeout,
        };

        let mut workers = Vec::with_capacity(self.config.clients);
        for index in 0..self.config.clients {
            let camera = Camera::new(index, |name| self.config.client_topic(name));
            workers.push(tokio::spawn(run_camera(
                camera,
                links.clone(),
                timing,
                gate.clone(),
                self.token.clone(),
                self.aggregator.clone(),
            )));

            // Ramp large populations instead of stampeding the endpoint
            let spawned = index + 1;
            if self.config.spawn_batch > 0
                && spawned % self.config.spawn_batch == 0
                && spawned < self.config.clients
            {
                debug!("Spawned {} clients, pausing", spawned);
                time::sleep(self.config.spawn_pause).await;
            }
        }
        workers
    }

    async fn control_loop(&self, started: Instant) -> Verdict {
        let policy = TerminationPolicy::from_config(&self.config);
        let mut ticker = time::interval(self.config.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;

        loop {
            ticker.tick().await;
            ticks += 1;
            let elapsed = started.elapsed();
            self.aggregator.sample_series(elapsed);
            let recent = self.aggregator.recent(policy.window);

            if ticks % 100 == 0 {
                debug!(
                    "{:.1}s elapsed, {} series points",
                    elapsed.as_secs_f64(),
                    self.aggregator.series_len()
                );
            }

            let verdict = policy.decide(PolicyInput {
                elapsed,
                recent: &recent,
                shutdown: self.token.state(),
            });
            match verdict {
                Verdict::Continue => {}
                Verdict::AwaitConfirmation => {
                    if self.await_confirmation().await {
                        info!("Termination confirmed");
                        return Verdict::StopConfirmed;
                    }
                    info!("Termination declined, continuing");
                }
                Verdict::StopTimeout => {
                    info!("Timeout reached after {:.2}s", elapsed.as_secs_f64());
                    return verdict;
                }
                Verdict::StopConverged => {
                    info!("Latency variance below threshold, stopping");
                    return verdict;
                }
                Verdict::StopConfirmed => return verdict,
            }
        }
    }

    /// Ask the operator; a second interrupt while waiting counts as yes
    async fn await_confirmation(&self) -> bool {
        let seen = self.token.interrupt_count();
        tokio::select! {
            confirmed = self.confirmer.confirm() => {
                if !confirmed {
                    self.token.decline();
                }
                confirmed
            }
            _ = self.token.next_interrupt(seen) => {
                info!("Second interrupt while awaiting confirmation");
                true
            }
        }
    }

    async fn drain(&self, workers: Vec<JoinHandle<CameraOutcome>>) {
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let grace: Duration = self.config.grace_period;

        match time::timeout(grace, join_all(workers)).await {
            Ok(results) => {
                let mut dropped = 0;
                for result in results {
                    match result {
                        Ok(CameraOutcome::Dropped) => dropped += 1,
                        Ok(CameraOutcome::Completed) => {}
                        Err(e) => warn!("Client worker failed: {}", e),
                    }
                }
                info!("All clients stopped ({} dropped)", dropped);
            }
            Err(_) => {
                let stuck = aborts.iter().filter(|h| !h.is_finished()).count();
                warn!(
                    "{} clients did not acknowledge shutdown within {:?}; merging what arrived",
                    stuck, grace
                );
                for handle in aborts {
                    handle.abort();
                }
            }
        }
    }
}
