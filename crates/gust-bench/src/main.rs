use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;

use gust_bench::{
    random_scene, run_sweep, spawn_signal_listener, AutoConfirm, BenchConfig, Confirmer,
    Orchestrator, PromptConfirmer, RunReport, SignalRoute, SweepPlan, SweepReport, WindowPolicy,
};
use gust_client::{LoopbackBroker, MqttTransport, Transport};

#[derive(Parser)]
#[command(name = "gust-bench")]
#[command(about = "Publish/subscribe latency and load benchmark")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one benchmark with a fixed client population
    Run(RunArgs),
    /// Run benchmarks for 1, 1+step, ... up to max-clients clients
    Sweep {
        #[arg(long, default_value = "50")]
        max_clients: usize,

        #[arg(long, default_value = "10")]
        step: usize,

        /// Seconds to wait between runs
        #[arg(long, default_value = "1")]
        pause_secs: u64,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Print a saved run or sweep artifact
    Report { path: PathBuf },
}

#[derive(Args, Clone)]
struct RunArgs {
    #[arg(long, default_value = "1")]
    clients: usize,

    #[arg(long, default_value = "127.0.0.1")]
    broker: String,

    #[arg(long, default_value = "1883")]
    port: u16,

    /// Subscribe through a second broker to measure forwarding latency
    #[arg(long)]
    broker2: Option<String>,

    #[arg(long, default_value = "7883")]
    port2: u16,

    #[arg(long, default_value = "benchmark")]
    name: String,

    #[arg(long, default_value = "3")]
    timeout_mins: f64,

    /// Overrides --timeout-mins
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long, default_value = "100")]
    sample_interval_ms: u64,

    #[arg(long, default_value = "100")]
    tick_interval_ms: u64,

    #[arg(long, value_enum, default_value = "windowed")]
    window: WindowPolicy,

    #[arg(long, default_value = "data")]
    output_dir: PathBuf,

    /// Scene identifier; random when omitted
    #[arg(long)]
    scene: Option<String>,

    /// Stop on the first interrupt without asking
    #[arg(long)]
    no_confirm: bool,

    /// Run against an in-process echo endpoint instead of a broker
    #[arg(long)]
    loopback: bool,

    #[arg(long, default_value = "0")]
    loopback_delay_ms: u64,
}

impl RunArgs {
    fn config(&self) -> BenchConfig {
        let timeout = match self.timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            // Negative or NaN falls through to zero, which validation rejects
            None => Duration::try_from_secs_f64(self.timeout_mins * 60.0).unwrap_or(Duration::ZERO),
        };
        BenchConfig {
            run_name: self.name.clone(),
            clients: self.clients,
            endpoint: format!("{}:{}", self.broker, self.port),
            relay_endpoint: self
                .broker2
                .as_ref()
                .map(|host| format!("{}:{}", host, self.port2)),
            scene: self.scene.clone().unwrap_or_else(random_scene),
            timeout,
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            window_policy: self.window,
            output_dir: self.output_dir.clone(),
            ..BenchConfig::default()
        }
    }

    /// Publish transport plus the optional relay transport
    fn transports(&self, config: &BenchConfig) -> (Arc<dyn Transport>, Option<Arc<dyn Transport>>) {
        if self.loopback {
            let broker = LoopbackBroker::echo_with_delay(Duration::from_millis(self.loopback_delay_ms));
            info!("Using in-process loopback endpoint");
            return (Arc::new(broker.transport()), None);
        }
        let relay = config
            .relay_endpoint
            .as_ref()
            .map(|addr| Arc::new(MqttTransport::new(addr.clone())) as Arc<dyn Transport>);
        (Arc::new(MqttTransport::new(config.endpoint.clone())), relay)
    }

    fn confirmer(&self) -> Arc<dyn Confirmer> {
        if self.no_confirm {
            Arc::new(AutoConfirm(true))
        } else {
            Arc::new(PromptConfirmer::stdin())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let config = args.config();
            let (transport, relay) = args.transports(&config);
            let mut orchestrator =
                Orchestrator::new(config, transport)?.with_confirmer(args.confirmer());
            if let Some(relay) = relay {
                orchestrator = orchestrator.with_relay(relay);
            }

            let route = SignalRoute::new();
            route.set(orchestrator.token());
            spawn_signal_listener(route);

            let outcome = orchestrator.run().await?;
            outcome.report.print();
            println!("Saved {}", outcome.artifact.display());
        }
        Commands::Sweep {
            max_clients,
            step,
            pause_secs,
            run,
        } => {
            let base = run.config();
            let (transport, relay) = run.transports(&base);
            let route = SignalRoute::new();
            spawn_signal_listener(route.clone());

            let plan = SweepPlan {
                base,
                max_clients,
                step,
                pause: Duration::from_secs(pause_secs),
            };
            let sweep = run_sweep(plan, transport, relay, run.confirmer(), &route).await?;
            println!(
                "Sweep '{}' finished with {} runs",
                sweep.name,
                sweep.clients.len()
            );
        }
        Commands::Report { path } => match RunReport::load(&path) {
            Ok(report) => report.print(),
            Err(_) => {
                let sweep = SweepReport::load(&path)
                    .with_context(|| format!("{} is not a run or sweep artifact", path.display()))?;
                print_sweep(&sweep);
            }
        },
    }

    Ok(())
}

fn print_sweep(sweep: &SweepReport) {
    println!(
        "=== Sweep {} (max {} clients, step {}) ===",
        sweep.name, sweep.max_clients, sweep.step
    );
    println!(
        "{:>8} {:>12} {:>12} {:>12} {:>8} {:>8}",
        "clients", "latency ms", "bpms sent", "bpms recvd", "dropped", "loss %"
    );
    for i in 0..sweep.clients.len() {
        let lats = &sweep.avg_lats[i];
        let latency = if lats.is_empty() {
            f64::NAN
        } else {
            lats.iter().sum::<f64>() / lats.len() as f64
        };
        println!(
            "{:>8} {:>12.3} {:>12.3} {:>12.3} {:>8} {:>8.2}",
            sweep.clients[i],
            latency,
            sweep.bpms_sent[i],
            sweep.bpms_recvd[i],
            sweep.dropped_clients[i],
            sweep.dropped_packets_percent[i] * 100.0,
        );
    }
}
