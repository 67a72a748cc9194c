//! `faultline` command-line entry point.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use faultline::backend::ClusterBackends;
use faultline::cluster::{ClusterOperation, KillMode, NodeAction};
use faultline::controller::IterationController;
use faultline::error::{EXIT_ERROR, exit_code_for};
use faultline::report;
use faultline::settings::{AppConfig, BackendKind, LogFormat, TimingConfig};
use faultline::trace;

#[derive(Parser, Debug)]
#[command(name = "faultline")]
#[command(about = "Fault injection and convergence verification for replicated database clusters")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run fault-injection iterations against a cluster
    Run(RunArgs),
    /// Print the expected node state for every action, operation and wipe outcome
    Table {
        /// Output in JSON format instead of a table
        #[arg(long)]
        json: bool,
    },
}

/// Flags override the values from the config file.
#[derive(clap::Args, Debug)]
struct RunArgs {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Number of iterations to run
    #[arg(short = 'n', long)]
    iterations: Option<u32>,

    /// Directory for the run log and iteration summary
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// What to do to each selected node
    #[arg(short = 'a', long, value_enum)]
    node_action: Option<NodeAction>,

    /// What to do to the whole cluster afterwards
    #[arg(short = 'o', long, value_enum)]
    cluster_operation: Option<ClusterOperation>,

    /// Number of nodes to act on per iteration
    #[arg(short = 'k', long)]
    node_count: Option<usize>,

    #[arg(long, value_enum)]
    kill_mode: Option<KillMode>,

    /// Select whole mirror pairs
    #[arg(long)]
    allow_mirrors: bool,

    /// Allow spare nodes in the selection
    #[arg(long)]
    allow_spares: bool,

    /// Act on the same nodes every iteration
    #[arg(long)]
    reuse_nodes: bool,

    /// Draw a random node action and cluster operation every iteration
    #[arg(long)]
    roll_nodes: bool,

    /// Always include the current master
    #[arg(long)]
    follow_master: bool,

    /// Seed for node selection and rolls
    #[arg(long)]
    seed: Option<u64>,

    /// Host that runs cluster-level commands
    #[arg(long)]
    admin_host: Option<String>,

    /// Run against an in-memory simulated cluster of N nodes
    #[arg(long, value_name = "N")]
    simulate: Option<u32>,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, cfg: &mut AppConfig) {
        if let Some(n) = self.iterations {
            cfg.run.iterations = n;
        }
        if let Some(dir) = &self.log_dir {
            cfg.run.log_dir = dir.clone();
        }
        if let Some(format) = self.log_format {
            cfg.run.log_format = format;
        }
        if let Some(seed) = self.seed {
            cfg.run.seed = Some(seed);
        }

        let scenario = &mut cfg.scenario;
        if let Some(action) = self.node_action {
            scenario.node_action = action;
        }
        if let Some(op) = self.cluster_operation {
            scenario.cluster_operation = op;
        }
        if let Some(count) = self.node_count {
            scenario.node_count = count;
        }
        if let Some(mode) = self.kill_mode {
            scenario.kill_mode = mode;
        }
        scenario.allow_mirrors |= self.allow_mirrors;
        scenario.allow_spares |= self.allow_spares;
        scenario.reuse_nodes |= self.reuse_nodes;
        scenario.roll_nodes |= self.roll_nodes;
        scenario.follow_master |= self.follow_master;

        if let Some(host) = &self.admin_host {
            cfg.cluster.admin_host = Some(host.clone());
        }
        if let Some(nodes) = self.simulate {
            cfg.cluster.backend = BackendKind::Sim;
            cfg.cluster.sim_nodes = nodes;
            cfg.cluster.sim_spares = cfg.cluster.sim_spares.min(nodes / 2);
            cfg.timing = TimingConfig::simulated();
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut cfg = AppConfig::load(args.config.as_deref())?;
    args.apply(&mut cfg);

    // an unusable log dir is reported by setup; log to stderr only until then
    let log_file = std::fs::create_dir_all(&cfg.run.log_dir)
        .ok()
        .map(|()| trace::run_log_path(&cfg.run.log_dir));
    trace::init(cfg.run.log_format, log_file.as_deref())?;

    let backends = ClusterBackends::from_config(&cfg)?;
    let mut controller = IterationController::new(cfg, backends)?;
    let report = controller.run().await;

    report::write_report(&mut io::stdout(), &report, args.json)?;
    Ok(exit_code_for(report.error()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let res = match args.command {
        Command::Run(run_args) => run(run_args).await,
        Command::Table { json } => {
            report::write_table(&mut io::stdout(), json).map(|()| ExitCode::SUCCESS)
        }
    };
    match res {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}
