use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::Arc;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use gust_client::{Connection, Delivery, Transport};
use gust_core::{now_micros, GustError, Pose, Quaternion, Result, StateUpdate};

use crate::{MetricsAggregator, ShutdownToken, StartGate, TerminalCounters};

/// Per-axis sigma of the position random walk
pub const POSITION_SIGMA: [f64; 3] = [0.1, 0.05, 0.1];
/// Sigma of each Euler angle drawn per tick (radians)
pub const ANGLE_SIGMA: f64 = 6.28;

/// Running means over a client's own echoes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CameraStats {
    latency_samples: u64,
    mean_latency_ms: f64,
    bpms_samples: u64,
    mean_bytes_per_ms: f64,
}

impl CameraStats {
    pub fn record(&mut self, latency_ms: f64, payload_len: usize) {
        self.latency_samples += 1;
        self.mean_latency_ms += (latency_ms - self.mean_latency_ms) / self.latency_samples as f64;

        if latency_ms > 0.0 {
            let bpms = payload_len as f64 / latency_ms;
            self.bpms_samples += 1;
            self.mean_bytes_per_ms += (bpms - self.mean_bytes_per_ms) / self.bpms_samples as f64;
        }
    }

    pub fn samples(&self) -> u64 {
        self.latency_samples
    }

    pub fn mean_latency_ms(&self) -> Option<f64> {
        (self.latency_samples > 0).then_some(self.mean_latency_ms)
    }

    pub fn mean_bytes_per_ms(&self) -> Option<f64> {
        (self.bpms_samples > 0).then_some(self.mean_bytes_per_ms)
    }
}

/// A simulated camera: owns its pose, stats and counters exclusively
#[derive(Debug)]
pub struct Camera {
    name: String,
    color: String,
    topic: String,
    pose: Pose,
    rng: StdRng,
    stats: CameraStats,
    counters: TerminalCounters,
}

impl Camera {
    pub fn new(index: usize, topic_for: impl FnOnce(&str) -> String) -> Self {
        Self::with_rng(index, StdRng::from_entropy(), topic_for)
    }

    pub fn with_rng(index: usize, mut rng: StdRng, topic_for: impl FnOnce(&str) -> String) -> Self {
        let suffix: String = (0..5)
            .map(|_| char::from_digit(rng.gen_range(0..36), 36).unwrap_or('0'))
            .collect();
        let name = format!("camera_{}_{:04}", suffix, index);
        let color = format!(
            "#{:02X}{:02X}{:02X}",
            rng.gen::<u8>(),
            rng.gen::<u8>(),
            rng.gen::<u8>()
        );
        let topic = topic_for(&name);

        Self {
            name,
            color,
            topic,
            pose: Pose::default(),
            rng,
            stats: CameraStats::default(),
            counters: TerminalCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn stats(&self) -> CameraStats {
        self.stats
    }

    pub fn counters(&self) -> TerminalCounters {
        self.counters
    }

    /// Random-walk the position and draw a fresh orientation
    pub fn step(&mut self) {
        let (dx, dy, dz) = (
            self.gaussian(POSITION_SIGMA[0]),
            self.gaussian(POSITION_SIGMA[1]),
            self.gaussian(POSITION_SIGMA[2]),
        );
        self.pose.position.x += dx;
        self.pose.position.y += dy;
        self.pose.position.z += dz;

        let (roll, pitch, yaw) = (
            self.gaussian(ANGLE_SIGMA),
            self.gaussian(ANGLE_SIGMA),
            self.gaussian(ANGLE_SIGMA),
        );
        self.pose.rotation = Quaternion::from_euler(roll, pitch, yaw);
    }

    fn gaussian(&mut self, sigma: f64) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        sigma * z
    }

    pub fn state_update(&self, timestamp_us: u64) -> Result<Vec<u8>> {
        StateUpdate::camera(&self.name, &self.color, &self.pose, timestamp_us).to_bytes()
    }

    pub fn record_publish(&mut self, payload_len: usize) {
        self.counters.packets_sent += 1;
        self.counters.bytes_sent += payload_len as u64;
    }

    /// Account for a delivery; returns true if it was this camera's own echo
    pub fn observe(&mut self, delivery: &Delivery, now_us: u64) -> bool {
        let Some(update) = StateUpdate::parse(&delivery.payload) else {
            debug!("{} ignoring undecodable message on {}", self.name, delivery.topic);
            return false;
        };
        if update.object_id != self.name {
            return false;
        }

        // Clocks may disagree across hosts; latency never goes negative
        let latency_ms = now_us.saturating_sub(update.timestamp_us) as f64 / 1000.0;
        self.stats.record(latency_ms, delivery.payload.len());
        self.counters.packets_received += 1;
        self.counters.bytes_received += delivery.payload.len() as u64;
        true
    }

    fn in_flight(&self) -> u64 {
        self.counters
            .packets_sent
            .saturating_sub(self.counters.packets_received)
    }
}

/// Where and how a camera connects
#[derive(Clone)]
pub struct CameraLinks {
    pub publish: Arc<dyn Transport>,
    /// Subscribe through a second endpoint when set
    pub subscribe: Option<Arc<dyn Transport>>,
    pub filter: String,
}

/// Timing knobs for a camera worker
#[derive(Debug, Clone, Copy)]
pub struct CameraTiming {
    pub tick_interval: Duration,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraOutcome {
    Dropped,
    Completed,
}

struct Session {
    publisher: Connection,
    subscriber: Option<Connection>,
}

impl Session {
    async fn open(name: &str, links: &CameraLinks) -> Result<Self> {
        let mut publisher = links.publish.connect(name).await?;
        match Self::open_subscriber(name, links, &mut publisher).await {
            Ok(subscriber) => Ok(Self {
                publisher,
                subscriber,
            }),
            Err(e) => {
                let _ = publisher.disconnect().await;
                Err(e)
            }
        }
    }

    async fn open_subscriber(
        name: &str,
        links: &CameraLinks,
        publisher: &mut Connection,
    ) -> Result<Option<Connection>> {
        match &links.subscribe {
            Some(relay) => {
                let mut conn = relay.connect(name).await?;
                if let Err(e) = conn.subscribe(&links.filter).await {
                    let _ = conn.disconnect().await;
                    return Err(e);
                }
                Ok(Some(conn))
            }
            None => {
                publisher.subscribe(&links.filter).await?;
                Ok(None)
            }
        }
    }

    async fn recv(&mut self) -> Option<Delivery> {
        match &mut self.subscriber {
            Some(conn) => conn.recv().await,
            None => self.publisher.recv().await,
        }
    }

    async fn close(self) {
        if let Some(conn) = self.subscriber {
            if let Err(e) = conn.disconnect().await {
                debug!("Subscriber disconnect failed: {}", e);
            }
        }
        if let Err(e) = self.publisher.disconnect().await {
            debug!("Publisher disconnect failed: {}", e);
        }
    }
}

/// Drive one camera from connect to terminal-counter handoff.
///
/// A failed or timed-out connect reports exactly one dropped client and never
/// enters the tick loop.
pub async fn run_camera(
    mut camera: Camera,
    links: CameraLinks,
    timing: CameraTiming,
    gate: StartGate,
    token: ShutdownToken,
    aggregator: Arc<MetricsAggregator>,
) -> CameraOutcome {
    let opened = time::timeout(timing.connect_timeout, Session::open(camera.name(), &links))
        .await
        .unwrap_or_else(|_| {
            Err(GustError::Timeout(format!(
                "no connection after {:?}",
                timing.connect_timeout
            )))
        });
    let mut session = match opened {
        Ok(session) => session,
        Err(e) => {
            warn!("Client {} dropped: {}", camera.name(), e);
            aggregator.merge_terminal(TerminalCounters::dropped());
            return CameraOutcome::Dropped;
        }
    };
    info!("Client {} connected", camera.name());

    tokio::select! {
        _ = gate.wait() => {}
        _ = token.cancelled() => {}
    }

    let mut ticker = time::interval(timing.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut inbox_open = true;

    while !token.is_cancelled() {
        tokio::select! {
            biased;

            _ = token.cancelled() => break,

            delivery = session.recv(), if inbox_open => match delivery {
                Some(delivery) => {
                    camera.observe(&delivery, now_micros());
                }
                None => {
                    warn!("Client {} lost its subscription stream", camera.name());
                    inbox_open = false;
                }
            },

            _ = ticker.tick() => {
                camera.step();
                publish_tick(&mut camera, &mut session.publisher, &links).await;
                let stats = camera.stats();
                if let Some(latency) = stats.mean_latency_ms() {
                    aggregator.contribute(latency, stats.mean_bytes_per_ms());
                }
            }
        }
    }

    // Give echoes already in flight a bounded chance to land
    let deadline = Instant::now() + timing.drain_timeout;
    while inbox_open && camera.in_flight() > 0 {
        match time::timeout_at(deadline, session.recv()).await {
            Ok(Some(delivery)) => {
                camera.observe(&delivery, now_micros());
            }
            Ok(None) | Err(_) => break,
        }
    }

    session.close().await;
    debug!("Client {} finished: {:?}", camera.name(), camera.counters());
    aggregator.merge_terminal(camera.counters());
    CameraOutcome::Completed
}

async fn publish_tick(camera: &mut Camera, publisher: &mut Connection, links: &CameraLinks) {
    let payload = match camera.state_update(now_micros()) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Client {} could not encode state: {}", camera.name(), e);
            return;
        }
    };
    let len = payload.len();
    let topic = camera.topic().to_string();
    match publisher.publish(&topic, payload).await {
        Ok(()) => camera.record_publish(len),
        Err(e) => debug!(
            "Client {} publish via {} failed: {}",
            camera.name(),
            links.publish.describe(),
            e
        ),
    }
}
