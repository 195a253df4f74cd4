//! Agent Simulation Kernel
//!
//! Runs the market scenario on one node, or on an in-process cluster when
//! more than one node is configured.

use clap::Parser;
use sim_cluster::{merge_outputs, Cluster, MigrationPolicy, NodeReport, Rebalance, Stationary};
use sim_kernel::demo::{market_registry, MarketScenario};
use sim_kernel::{KernelConfig, Model};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments for the simulation
#[derive(Parser, Debug)]
#[command(name = "kernel_sim")]
#[command(about = "Discrete-event agent simulation running a market scenario")]
struct Args {
    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// First simulated time point
    #[arg(long)]
    start: Option<u64>,

    /// Time point the simulation stops at
    #[arg(long)]
    end: Option<u64>,

    /// Sample number, varied to get independent runs
    #[arg(long)]
    sample: Option<u64>,

    /// Worker threads per node
    #[arg(long)]
    threads: Option<usize>,

    /// Number of nodes
    #[arg(long)]
    nodes: Option<usize>,

    /// Directory outputs are written to
    #[arg(long)]
    output: Option<PathBuf>,

    /// Number of traders
    #[arg(long, default_value_t = 16)]
    traders: usize,

    /// Resting orders the exchange can hold
    #[arg(long, default_value_t = 64)]
    book_capacity: usize,

    /// Move traders towards underloaded nodes after each step
    #[arg(long)]
    rebalance: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(args: &Args) -> Result<KernelConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => KernelConfig::from_file(path)?,
        None => KernelConfig::default(),
    };
    if let Some(start) = args.start {
        config.simulation.start = start;
    }
    if let Some(end) = args.end {
        config.simulation.end = end;
    }
    if let Some(sample) = args.sample {
        config.simulation.sample = sample;
    }
    if let Some(threads) = args.threads {
        config.execution.threads = threads;
    }
    if let Some(nodes) = args.nodes {
        config.cluster.nodes = nodes;
    }
    if args.output.is_some() {
        config.output.directory = args.output.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args, config: KernelConfig) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = MarketScenario {
        traders: args.traders,
        book_capacity: args.book_capacity,
        ..MarketScenario::default()
    };

    if config.cluster.nodes <= 1 {
        let mut model = Model::new(&config)?;
        let summary = model.run(&mut scenario.clone())?;
        println!("Steps: {}", summary.steps);
        println!("Rounds: {}", summary.rounds);
        println!("Messages: {}", summary.messages);
        println!("Agents: {}", summary.local_agents);
        return Ok(());
    }

    let rebalance = args.rebalance;
    let cluster = Cluster::new(config, market_registry()).with_policy(move |_| -> Box<dyn MigrationPolicy> {
        if rebalance {
            Box::new(Rebalance::default())
        } else {
            Box::new(Stationary)
        }
    });
    let reports = cluster.run(|_| scenario.clone())?;
    print_reports(&reports);
    Ok(())
}

fn print_reports(reports: &[NodeReport]) {
    for report in reports {
        println!(
            "{}: {} steps, {} rounds, {} agents, {} in / {} out, {} remote messages",
            report.node,
            report.summary.steps,
            report.summary.rounds,
            report.local_agents.len(),
            report.stats.migrations_in,
            report.stats.migrations_out,
            report.stats.remote_messages,
        );
    }
    println!("Agents with outputs: {}", merge_outputs(reports).len());
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if args.print_config {
        return match config.to_toml() {
            Ok(text) => {
                print!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "could not render configuration");
                ExitCode::FAILURE
            }
        };
    }

    println!("Agent Simulation Kernel");
    println!("=======================");
    println!("Interval: [{}, {})", config.simulation.start, config.simulation.end);
    println!("Sample: {}", config.simulation.sample);
    println!("Nodes: {}", config.cluster.nodes);
    println!("Threads per node: {}", config.execution.threads);
    println!();

    match run(&args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "simulation failed");
            ExitCode::FAILURE
        }
    }
}
