use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gust_client::Transport;
use gust_core::SystemSample;

/// CPU and memory samples observed during a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSamples {
    pub cpu: Vec<f64>,
    pub mem: Vec<f64>,
}

impl SystemSamples {
    pub fn record(&mut self, sample: SystemSample) {
        self.cpu.push(sample.cpu);
        self.mem.push(sample.mem);
    }

    pub fn len(&self) -> usize {
        self.cpu.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty()
    }

    pub fn mean_cpu(&self) -> Option<f64> {
        mean(&self.cpu)
    }

    pub fn mean_mem(&self) -> Option<f64> {
        mean(&self.mem)
    }
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Background subscriber recording the system probe's samples
pub struct MetricsListener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<SystemSamples>,
}

impl MetricsListener {
    /// Subscribe to `topic` and record samples until stopped.
    ///
    /// A listener that cannot connect logs and records nothing; it never
    /// affects the run.
    pub fn spawn(transport: Arc<dyn Transport>, client_id: String, topic: String) -> Self {
        let (stop, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut samples = SystemSamples::default();
            let connected = tokio::select! {
                _ = &mut stop_rx => return samples,
                connected = transport.connect(&client_id) => connected,
            };
            let mut conn = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Metrics listener could not connect: {}", e);
                    return samples;
                }
            };
            if let Err(e) = conn.subscribe(&topic).await {
                warn!("Metrics listener could not subscribe to {}: {}", topic, e);
                let _ = conn.disconnect().await;
                return samples;
            }
            info!("Metrics listener subscribed to {}", topic);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,

                    delivery = conn.recv() => match delivery {
                        Some(delivery) => match SystemSample::parse(&delivery.payload) {
                            Some(sample) => samples.record(sample),
                            None => debug!("Ignoring malformed sample on {}", delivery.topic),
                        },
                        None => {
                            warn!("Metrics listener connection closed");
                            // Stay until stopped so the handle contract holds
                            let _ = (&mut stop_rx).await;
                            break;
                        }
                    },
                }
            }

            if let Err(e) = conn.disconnect().await {
                debug!("Metrics listener disconnect failed: {}", e);
            }
            samples
        });

        Self { stop, task }
    }

    /// Disconnect and hand back everything recorded
    pub async fn stop(self) -> SystemSamples {
        let _ = self.stop.send(());
        match self.task.await {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Metrics listener task failed: {}", e);
                SystemSamples::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gust_client::LoopbackBroker;
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_records_samples_and_skips_junk() {
        let broker = LoopbackBroker::silent();
        let listener = MetricsListener::spawn(
            Arc::new(broker.transport()),
            "cpu_mem_log_bench".to_string(),
            "cpu_mem".to_string(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        broker.inject("cpu_mem", br#"{"cpu": 0.5, "mem": 0.25}"#.to_vec());
        broker.inject("cpu_mem", b"garbage".to_vec());
        broker.inject("cpu_mem", br#"{"cpu": 0.7, "mem": 0.35}"#.to_vec());
        broker.inject("elsewhere", br#"{"cpu": 9.0, "mem": 9.0}"#.to_vec());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let samples = listener.stop().await;
        assert_eq!(samples.len(), 2);
        assert!((samples.mean_cpu().unwrap() - 0.6).abs() < 1e-12);
        assert!((samples.mean_mem().unwrap() - 0.3).abs() < 1e-12);
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_probe_yields_no_samples() {
        let broker = LoopbackBroker::echo();
        broker.refuse_connections(1);
        let listener =
            MetricsListener::spawn(Arc::new(broker.transport()), "l".to_string(), "cpu_mem".to_string());
        let samples = listener.stop().await;
        assert!(samples.is_empty());
        assert_eq!(samples.mean_cpu(), None);
    }

    #[tokio::test]
    async fn test_stop_while_connect_stalls() {
        let broker = LoopbackBroker::echo();
        broker.stall_connections(1);
        let listener =
            MetricsListener::spawn(Arc::new(broker.transport()), "l".to_string(), "cpu_mem".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let samples = tokio::time::timeout(Duration::from_secs(1), listener.stop())
            .await
            .expect("stop must not wait on a stalled connect");
        assert!(samples.is_empty());
    }
}
