use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;

use gust_client::Transport;
use gust_core::Result;

use crate::{random_scene, BenchConfig, Confirmer, Orchestrator, SignalRoute, SweepReport, Verdict};

/// Population sizes visited by a sweep: 1, 1+step, ... up to `max_clients`
pub fn population_sizes(max_clients: usize, step: usize) -> Vec<usize> {
    (1..=max_clients).step_by(step.max(1)).collect()
}

pub struct SweepPlan {
    pub base: BenchConfig,
    pub max_clients: usize,
    pub step: usize,
    /// Pause between consecutive runs
    pub pause: Duration,
}

/// Run one benchmark per population size and persist the combined results.
///
/// An operator-confirmed stop ends the whole sweep; timeouts and convergence
/// move on to the next population.
pub async fn run_sweep(
    plan: SweepPlan,
    transport: Arc<dyn Transport>,
    relay: Option<Arc<dyn Transport>>,
    confirmer: Arc<dyn Confirmer>,
    route: &SignalRoute,
) -> Result<SweepReport> {
    let mut sweep = SweepReport::new(&plan.base.run_name, plan.max_clients, plan.step);
    let sizes = population_sizes(plan.max_clients, plan.step);

    for (i, clients) in sizes.iter().copied().enumerate() {
        println!("----- Running benchmark with {} clients -----", clients);
        let config = BenchConfig {
            run_name: format!("{}_c{}", plan.base.run_name, clients),
            clients,
            scene: random_scene(),
            ..plan.base.clone()
        };

        let mut orchestrator =
            Orchestrator::new(config, transport.clone())?.with_confirmer(confirmer.clone());
        if let Some(relay) = &relay {
            orchestrator = orchestrator.with_relay(relay.clone());
        }
        route.set(orchestrator.token());

        let outcome = orchestrator.run().await?;
        outcome.report.print();
        sweep.push(&outcome.report);

        if outcome.report.verdict == Verdict::StopConfirmed {
            info!("Sweep stopped by operator after {} clients", clients);
            break;
        }
        if i + 1 < sizes.len() {
            tokio::time::sleep(plan.pause).await;
        }
    }

    let path = sweep.save(&plan.base.output_dir)?;
    info!("Sweep results written to {}", path.display());
    Ok(sweep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_population_sizes() {
        assert_eq!(population_sizes(1, 1), vec![1]);
        assert_eq!(population_sizes(10, 3), vec![1, 4, 7, 10]);
        assert_eq!(population_sizes(10, 4), vec![1, 5, 9]);
        assert_eq!(population_sizes(3, 0), vec![1, 2, 3]);
        assert!(population_sizes(0, 1).is_empty());
    }
}
