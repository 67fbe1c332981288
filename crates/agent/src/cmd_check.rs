//! `check` command: build the cluster, pick the check, run it.

use std::sync::Arc;

use anyhow::{Context, Result};
use hive_check::checks;
use hive_check::executor::{CheckSchedule, ExecutorConfig, RunSummary, StageExecutor};
use hive_check::metrics::{MetricsSink, NoopSink, PushGateway};
use hive_check::stage::StagePlan;
use hive_check::Options;
use hive_cluster::{ClusterSetup, HttpPlatform, MockPlatform, Platform, SetupMode};
use hive_common::random::random_seed;
use hive_common::{RunConfig, SeededRng};
use tracing::info;

use crate::RunArgs;

fn platform(cfg: &RunConfig, simulate: bool) -> Result<Arc<dyn Platform>> {
    if simulate {
        info!("using in-memory platform");
        return Ok(Arc::new(MockPlatform::new()));
    }
    let url = cfg
        .platform_url
        .as_deref()
        .context("no platform endpoint: pass --platform-url or set HIVE_PLATFORM_URL")?;
    let platform = HttpPlatform::new(url, cfg.namespace.clone()).context("creating platform client")?;
    Ok(Arc::new(platform))
}

fn metrics_sink(cfg: &RunConfig, check: &str) -> Result<Arc<dyn MetricsSink>> {
    match (&cfg.metrics.push_gateway, cfg.metrics.enabled) {
        (Some(url), true) => {
            let gateway = PushGateway::new(url.clone(), format!("hive-{}", check), cfg.namespace.clone())
                .context("creating push gateway client")?;
            info!(url = %gateway.push_url(), "metrics enabled");
            Ok(Arc::new(gateway))
        }
        _ => Ok(Arc::new(NoopSink)),
    }
}

fn stage_plan(cfg: &RunConfig) -> Result<StagePlan> {
    match &cfg.stages_file {
        Some(path) => StagePlan::load(path).with_context(|| format!("loading stage plan {}", path)),
        None => Ok(StagePlan::default_plan()),
    }
}

fn print_summary(check: &str, summary: &RunSummary) {
    println!("check:        {}", check);
    println!("seed:         {}", summary.seed);
    println!("stages:       {}", summary.stages_applied);
    println!("checks:       {}", summary.checks_passed);
    println!("assignments:  {}", summary.assignments.len());
    println!("observations: {}", summary.observation_count());
}

pub async fn run_check(name: &str, cfg: &RunConfig, args: &RunArgs) -> Result<()> {
    cfg.validate().context("invalid configuration")?;
    let check = checks::by_name(name).with_context(|| format!("unknown check {}", name))?;

    let seed = cfg.seed.unwrap_or_else(random_seed);
    info!(seed, check = name, "using seed");
    let mut rng = SeededRng::new(seed);

    let mut setup = ClusterSetup::from_config(cfg);
    if args.simulate {
        // an in-memory platform has nothing to attach to
        setup.mode = SetupMode::Start;
    }
    let platform = platform(cfg, args.simulate)?;
    let cluster = setup
        .run(platform, &mut rng)
        .await
        .context("setting up cluster")?;
    info!(sizes = ?cluster.sizes(), "cluster ready");

    let mut options = Options::from_config(cfg, seed, metrics_sink(cfg, name)?);
    options.node_group = args.node_group.clone();

    let executor = StageExecutor::new(ExecutorConfig {
        schedule: if args.final_check_only {
            CheckSchedule::FinalStage
        } else {
            CheckSchedule::EveryStage
        },
        check_before_stages: args.check_before_stages,
        ..ExecutorConfig::from_config(cfg)
    });

    let summary = if cfg.dynamic {
        let plan = stage_plan(cfg)?;
        executor
            .run(&cluster, check.as_ref(), &options, &plan.stages, &mut rng)
            .await
    } else {
        executor.run_once(&cluster, check.as_ref(), &options, &mut rng).await
    }
    .with_context(|| format!("check {} failed (seed {})", name, seed))?;

    print_summary(name, &summary);
    Ok(())
}
