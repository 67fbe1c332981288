//! # Hive Agent CLI
//!
//! Runs one verification check against a storage cluster, optionally while
//! churning the cluster's membership stage by stage.
//!
//! ## Commands
//!
//! - `check ping`: every running node pings every other running node
//! - `check pinning`: pinned content survives garbage collection pressure
//! - `check soc`: a signed chunk round-trips byte for byte
//! - `plan`: print the stage plan a dynamic run would apply
//!
//! Without `--dynamic` the check runs once against the cluster as it is.
//! With `--dynamic` the stage plan (`--stages`, or the built-in three-stage
//! plan) is applied and the check runs after every stage.
//!
//! ## Environment Variables
//!
//! - `HIVE_PLATFORM_URL`: provisioning platform endpoint
//! - `HIVE_NAMESPACE`: namespace the workloads live in
//! - `HIVE_PUSH_GATEWAY`: metrics push gateway; enables metrics when set
//! - `RUST_LOG`: log filter (default `info`)

mod cmd_check;
mod cmd_plan;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hive_common::config::load_from_file;
use hive_common::RunConfig;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Hive churn and verification agent")]
struct Cli {
    /// TOML run configuration; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a check against the cluster
    Check {
        #[command(subcommand)]
        check: CheckCommands,
    },

    /// Print the stage plan a dynamic run would apply
    Plan {
        /// TOML stage plan (built-in plan when absent)
        #[arg(long)]
        stages: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CheckCommands {
    /// Every running node pings every other running node
    Ping {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Pinned content survives garbage collection pressure
    Pinning {
        #[command(flatten)]
        run: RunArgs,
        /// Node store size in chunks
        #[arg(long)]
        store_size: Option<usize>,
        /// Number of unpinned uploads used as GC pressure
        #[arg(long)]
        store_size_divisor: Option<usize>,
        /// Seconds to wait for garbage collection
        #[arg(long)]
        gc_wait_secs: Option<u64>,
    },

    /// A signed chunk round-trips byte for byte
    Soc {
        #[command(flatten)]
        run: RunArgs,
    },
}

/// Flags shared by every check.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Create and start the cluster instead of attaching to a running one
    #[arg(long)]
    pub start_cluster: bool,

    /// Churn membership with the stage plan between check runs
    #[arg(long)]
    pub dynamic: bool,

    #[arg(long)]
    pub cluster_name: Option<String>,

    #[arg(long, env = "HIVE_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "HIVE_PLATFORM_URL")]
    pub platform_url: Option<String>,

    #[arg(long, env = "HIVE_PUSH_GATEWAY")]
    pub push_gateway: Option<String>,

    #[arg(long)]
    pub bootnode_count: Option<usize>,

    /// Members per worker group at setup
    #[arg(long)]
    pub node_count: Option<usize>,

    #[arg(long)]
    pub bee_image: Option<String>,

    /// Run seed; a random one is chosen and printed when absent
    #[arg(long, allow_negative_numbers = true)]
    pub seed: Option<i64>,

    #[arg(long)]
    pub persistence: bool,

    #[arg(long)]
    pub storage_class: Option<String>,

    #[arg(long)]
    pub storage_request: Option<String>,

    /// TOML stage plan (built-in plan when absent)
    #[arg(long)]
    pub stages: Option<PathBuf>,

    /// Concurrent membership operations and probes
    #[arg(long)]
    pub buffer: Option<usize>,

    /// Node group the soc check uploads through
    #[arg(long, default_value = hive_check::check::DEFAULT_NODE_GROUP)]
    pub node_group: String,

    /// Also run the check once before the first stage
    #[arg(long)]
    pub check_before_stages: bool,

    /// Run the check only after the last stage
    #[arg(long)]
    pub final_check_only: bool,

    /// Run against an in-memory cluster instead of a platform
    #[arg(long)]
    pub simulate: bool,
}

impl RunArgs {
    /// Apply flags on top of the file configuration.
    fn apply(&self, cfg: &mut RunConfig) {
        if self.start_cluster {
            cfg.start_cluster = true;
        }
        if self.dynamic {
            cfg.dynamic = true;
        }
        if let Some(v) = &self.cluster_name {
            cfg.cluster_name = v.clone();
        }
        if let Some(v) = &self.namespace {
            cfg.namespace = v.clone();
        }
        if let Some(v) = &self.platform_url {
            cfg.platform_url = Some(v.clone());
        }
        if let Some(v) = &self.push_gateway {
            cfg.metrics.enabled = true;
            cfg.metrics.push_gateway = Some(v.clone());
        }
        if let Some(v) = self.bootnode_count {
            cfg.bootnode_count = v;
        }
        if let Some(v) = self.node_count {
            cfg.node_count = v;
        }
        if let Some(v) = &self.bee_image {
            cfg.image = v.clone();
        }
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        if self.persistence {
            cfg.persistence.enabled = true;
        }
        if let Some(v) = &self.storage_class {
            cfg.persistence.storage_class = v.clone();
        }
        if let Some(v) = &self.storage_request {
            cfg.persistence.storage_request = v.clone();
        }
        if let Some(p) = &self.stages {
            cfg.stages_file = Some(p.display().to_string());
        }
        if let Some(v) = self.buffer {
            cfg.buffer = v;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig> {
    match path {
        Some(p) => load_from_file(p).with_context(|| format!("loading config {}", p.display())),
        None => Ok(RunConfig::default()),
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let mut cfg = load_config(cli.config.as_ref())?;

    match cli.cmd {
        Commands::Plan { stages } => cmd_plan::print_plan(stages.as_deref()),

        Commands::Check { check } => {
            let (name, run) = match check {
                CheckCommands::Ping { run } => (hive_check::checks::pingpong::NAME, run),
                CheckCommands::Pinning {
                    run,
                    store_size,
                    store_size_divisor,
                    gc_wait_secs,
                } => {
                    if let Some(v) = store_size {
                        cfg.pinning.store_size = v;
                    }
                    if let Some(v) = store_size_divisor {
                        cfg.pinning.store_size_divisor = v;
                    }
                    if let Some(v) = gc_wait_secs {
                        cfg.pinning.gc_wait_secs = v;
                    }
                    (hive_check::checks::pinning::NAME, run)
                }
                CheckCommands::Soc { run } => (hive_check::checks::soc::NAME, run),
            };
            run.apply(&mut cfg);
            cmd_check::run_check(name, &cfg, &run).await
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
