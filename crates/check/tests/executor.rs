//! Stage executor against the in-memory platform.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive_check::checks::{PingCheck, PinningCheck};
use hive_check::executor::{CheckSchedule, ExecutorConfig, RunError, StageExecutor};
use hive_check::stage::{Action, Actions, Stage, StagePlan, Update};
use hive_check::{Check, CheckError, CheckReport, MemorySink, Options};
use hive_cluster::mock::PlatformAction;
use hive_cluster::{Cluster, ClusterError, MockPlatform, NodeGroupOptions, NodeOptions, PlatformError};
use hive_common::{RetryConfig, SeededRng};
use parking_lot::Mutex;

// ════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════

async fn cluster(platform: Arc<MockPlatform>, groups: &[(&str, usize)]) -> Cluster {
    let mut c = Cluster::new("exec", platform);
    for (name, n) in groups {
        let g = c.add_node_group(*name, NodeGroupOptions::default()).expect("group");
        for i in 0..*n {
            g.add_start(&format!("{}-{}", name, i), NodeOptions::default(), Duration::from_secs(5))
                .await
                .expect("add_start");
        }
    }
    c
}

fn executor(schedule: CheckSchedule) -> StageExecutor {
    StageExecutor::new(ExecutorConfig {
        buffer: 4,
        operation_timeout: Duration::from_secs(5),
        stage_timeout: Duration::from_secs(10),
        check_timeout: Duration::from_secs(10),
        schedule,
        check_before_stages: false,
    })
}

fn churn_stage() -> Stage {
    Stage::new(vec![
        Update::new("bee", Actions::new(2, 0, 1, 3)),
        Update::new("drone", Actions::new(4, 0, 3, 1)),
    ])
}

/// Records group sizes and running counts each time it runs.
#[derive(Default)]
struct SizeProbe {
    seen: Mutex<Vec<BTreeMap<String, (usize, usize)>>>,
}

#[async_trait]
impl Check for SizeProbe {
    fn name(&self) -> &str {
        "sizes"
    }

    async fn run(
        &self,
        cluster: &Cluster,
        _options: &Options,
        _rng: &mut SeededRng,
    ) -> Result<CheckReport, CheckError> {
        let snapshot = cluster
            .node_groups()
            .map(|g| (g.name().to_string(), (g.size(), g.running_names().len())))
            .collect();
        self.seen.lock().push(snapshot);
        Ok(CheckReport::new("sizes"))
    }
}

struct SlowCheck;

#[async_trait]
impl Check for SlowCheck {
    fn name(&self) -> &str {
        "slow"
    }

    async fn run(
        &self,
        _cluster: &Cluster,
        _options: &Options,
        _rng: &mut SeededRng,
    ) -> Result<CheckReport, CheckError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(CheckReport::new("slow"))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// STAGE APPLICATION
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stage_reaches_expected_sizes() {
    let platform = Arc::new(MockPlatform::new());
    let c = cluster(platform.clone(), &[("bee", 5), ("drone", 5)]).await;
    let probe = SizeProbe::default();

    let summary = executor(CheckSchedule::EveryStage)
        .run(&c, &probe, &Options::default(), &[churn_stage()], &mut SeededRng::new(42))
        .await
        .expect("run");

    assert_eq!(summary.stages_applied, 1);
    assert_eq!(summary.checks_passed, 1);
    assert_eq!(summary.assignments.len(), 2 + 1 + 3 + 4 + 3 + 1);

    let seen = probe.seen.lock();
    assert_eq!(seen.len(), 1);
    // bee: 5 + 2 - 3 members, one of them stopped
    assert_eq!(seen[0]["bee"], (4, 3));
    // drone: 5 + 4 - 1 members, three of them stopped
    assert_eq!(seen[0]["drone"], (8, 5));

    assert_eq!(platform.call_count(PlatformAction::Delete), 4);
    for deleted in summary.assignments.iter().filter(|a| a.action == Action::Delete) {
        assert!(platform.node(&deleted.node).is_none());
        assert!(c.node(&deleted.node).is_err());
    }
}

#[tokio::test]
async fn default_plan_applies_from_five_members() {
    for seed in [1, 7, 42] {
        let c = cluster(Arc::new(MockPlatform::new()), &[("bee", 5), ("drone", 5)]).await;
        let probe = SizeProbe::default();
        let summary = executor(CheckSchedule::EveryStage)
            .run(
                &c,
                &probe,
                &Options::default(),
                &StagePlan::default_plan().stages,
                &mut SeededRng::new(seed),
            )
            .await
            .expect("run");
        assert_eq!(summary.stages_applied, 3);

        let sizes: Vec<(usize, usize)> = probe
            .seen
            .lock()
            .iter()
            .map(|s| (s["bee"].0, s["drone"].0))
            .collect();
        // size + add - delete per stage
        assert_eq!(sizes, vec![(4, 8), (4, 9), (7, 11)]);
    }
}

#[tokio::test]
async fn delete_overlapping_stop_keeps_one_operation_per_node() {
    let platform = Arc::new(MockPlatform::new());
    let c = cluster(platform.clone(), &[("bee", 4)]).await;
    let probe = SizeProbe::default();
    let stage = Stage::new(vec![Update::new("bee", Actions::new(0, 0, 2, 3))]);

    let summary = executor(CheckSchedule::EveryStage)
        .run(&c, &probe, &Options::default(), &[stage], &mut SeededRng::new(13))
        .await
        .expect("run");

    // the survivor is the one member left to stop
    assert_eq!(probe.seen.lock()[0]["bee"], (1, 0));
    assert_eq!(platform.call_count(PlatformAction::Delete), 3);
    assert_eq!(platform.call_count(PlatformAction::Stop), 1);
    let mut nodes: Vec<&str> = summary.assignments.iter().map(|a| a.node.as_str()).collect();
    nodes.sort_unstable();
    nodes.dedup();
    assert_eq!(nodes.len(), summary.assignments.len());
}

#[tokio::test]
async fn same_seed_same_assignments() {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let c = cluster(Arc::new(MockPlatform::new()), &[("bee", 6), ("drone", 6)]).await;
        let summary = executor(CheckSchedule::EveryStage)
            .run(
                &c,
                &SizeProbe::default(),
                &Options::default(),
                &StagePlan::default_plan().stages,
                &mut SeededRng::new(7),
            )
            .await
            .expect("run");
        assert_eq!(summary.stages_applied, 3);
        let mut assignments = summary.assignments;
        assignments.sort_by(|a, b| (a.stage, &a.group, &a.node).cmp(&(b.stage, &b.group, &b.node)));
        runs.push(assignments);
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn stage_members_are_distinct() {
    let c = cluster(Arc::new(MockPlatform::new()), &[("bee", 6), ("drone", 6)]).await;
    let summary = executor(CheckSchedule::FinalStage)
        .run(
            &c,
            &SizeProbe::default(),
            &Options::default(),
            &StagePlan::default_plan().stages,
            &mut SeededRng::new(3),
        )
        .await
        .expect("run");

    for stage in 0..3 {
        let mut nodes: Vec<&str> = summary
            .assignments
            .iter()
            .filter(|a| a.stage == stage)
            .map(|a| a.node.as_str())
            .collect();
        let total = nodes.len();
        nodes.sort_unstable();
        nodes.dedup();
        assert_eq!(nodes.len(), total, "stage {} reuses a node", stage);
    }
}

// ════════════════════════════════════════════════════════════════════════════
// FAILURES
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn first_failure_cancels_siblings() {
    let platform = Arc::new(MockPlatform::new());
    let c = cluster(platform.clone(), &[("bee", 5), ("drone", 5)]).await;
    platform.fail_on(
        PlatformAction::Create,
        "bee-5",
        PlatformError::Rejected {
            name: "bee-5".into(),
            status: 500,
            body: "quota".into(),
        },
    );
    for i in 0..5 {
        platform.hang_on(PlatformAction::Stop, &format!("drone-{}", i));
    }

    let stage = Stage::new(vec![
        Update::new("bee", Actions::new(2, 0, 0, 0)),
        Update::new("drone", Actions::new(0, 0, 3, 0)),
    ]);
    let probe = SizeProbe::default();
    let err = executor(CheckSchedule::EveryStage)
        .run(&c, &probe, &Options::default(), &[stage], &mut SeededRng::new(1))
        .await
        .unwrap_err();

    let agg = match err {
        RunError::Stage(agg) => agg,
        other => panic!("expected a stage failure, got {:?}", other),
    };
    assert_eq!(agg.first.group, "bee");
    assert_eq!(agg.first.node, "bee-5");
    assert_eq!(agg.first.action, Action::Add);
    assert!(matches!(agg.first.source, ClusterError::Provision { .. }));
    // the three hung stops never finish on their own
    assert!((3..=4).contains(&agg.cancelled), "cancelled = {}", agg.cancelled);
    assert!(probe.seen.lock().is_empty());
}

#[tokio::test]
async fn infeasible_stage_touches_nothing() {
    let platform = Arc::new(MockPlatform::new());
    let c = cluster(platform.clone(), &[("bee", 5)]).await;
    let before = platform.calls().len();

    let stage = Stage::new(vec![Update::new("bee", Actions::new(1, 0, 6, 0))]);
    let err = executor(CheckSchedule::EveryStage)
        .run(&c, &SizeProbe::default(), &Options::default(), &[stage], &mut SeededRng::new(1))
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::InvalidPlan { stage: 0, ref group, .. } if group == "bee"));
    assert_eq!(platform.calls().len(), before);
    assert_eq!(c.node_group("bee").expect("group").running_names().len(), 5);
}

#[tokio::test]
async fn unknown_group_fails_before_first_stage() {
    let platform = Arc::new(MockPlatform::new());
    let c = cluster(platform.clone(), &[("bee", 5)]).await;
    let before = platform.calls().len();

    let stages = vec![
        Stage::new(vec![Update::new("bee", Actions::new(1, 0, 0, 0))]),
        Stage::new(vec![Update::new("light", Actions::new(1, 0, 0, 0))]),
    ];
    let err = executor(CheckSchedule::EveryStage)
        .run(&c, &SizeProbe::default(), &Options::default(), &stages, &mut SeededRng::new(1))
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::InvalidPlan { stage: 1, ref group, .. } if group == "light"));
    assert_eq!(platform.calls().len(), before);
}

#[tokio::test]
async fn hung_operation_hits_stage_deadline() {
    let platform = Arc::new(MockPlatform::new());
    let c = cluster(platform.clone(), &[("bee", 2)]).await;
    platform.hang_on(PlatformAction::Create, "bee-2");

    let exec = StageExecutor::new(ExecutorConfig {
        stage_timeout: Duration::from_millis(100),
        operation_timeout: Duration::from_secs(30),
        ..ExecutorConfig::default()
    });
    let stage = Stage::new(vec![Update::new("bee", Actions::new(1, 0, 0, 0))]);
    let err = exec
        .run(&c, &SizeProbe::default(), &Options::default(), &[stage], &mut SeededRng::new(1))
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::StageTimeout { stage: 0, cancelled: 1, .. }));
}

#[tokio::test]
async fn slow_check_times_out() {
    let c = cluster(Arc::new(MockPlatform::new()), &[("bee", 2)]).await;
    let exec = StageExecutor::new(ExecutorConfig {
        check_timeout: Duration::from_millis(50),
        ..ExecutorConfig::default()
    });
    let stage = Stage::new(vec![Update::new("bee", Actions::new(1, 0, 0, 0))]);
    let err = exec
        .run(&c, &SlowCheck, &Options::default(), &[stage], &mut SeededRng::new(1))
        .await
        .unwrap_err();

    match err {
        RunError::Check { stage, check, source } => {
            assert_eq!(stage, Some(0));
            assert_eq!(check, "slow");
            assert!(matches!(source, CheckError::Timeout(_)));
        }
        other => panic!("expected a check failure, got {:?}", other),
    }
    // the stage itself was applied
    assert_eq!(c.node_group("bee").expect("group").size(), 3);
}

// ════════════════════════════════════════════════════════════════════════════
// SCHEDULING AND CHECKS
// ════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn final_stage_schedule_checks_once() {
    let c = cluster(Arc::new(MockPlatform::new()), &[("bee", 6), ("drone", 6)]).await;
    let probe = SizeProbe::default();
    let summary = executor(CheckSchedule::FinalStage)
        .run(&c, &probe, &Options::default(), &StagePlan::default_plan().stages, &mut SeededRng::new(11))
        .await
        .expect("run");
    assert_eq!(summary.stages_applied, 3);
    assert_eq!(summary.checks_passed, 1);
    assert_eq!(probe.seen.lock().len(), 1);
}

#[tokio::test]
async fn empty_plan_still_checks_once() {
    let platform = Arc::new(MockPlatform::new());
    let c = cluster(platform.clone(), &[("bee", 2)]).await;
    let before = platform.calls().len();
    for schedule in [CheckSchedule::EveryStage, CheckSchedule::FinalStage] {
        let probe = SizeProbe::default();
        let summary = executor(schedule)
            .run(&c, &probe, &Options::default(), &[], &mut SeededRng::new(1))
            .await
            .expect("run");
        assert_eq!(summary.stages_applied, 0);
        assert_eq!(summary.checks_passed, 1);
        assert_eq!(probe.seen.lock().len(), 1);
    }
    assert_eq!(platform.calls().len(), before);
}

#[tokio::test]
async fn check_before_stages_sees_initial_cluster() {
    let c = cluster(Arc::new(MockPlatform::new()), &[("bee", 5), ("drone", 5)]).await;
    let exec = StageExecutor::new(ExecutorConfig {
        check_before_stages: true,
        ..ExecutorConfig::default()
    });
    let probe = SizeProbe::default();
    let summary = exec
        .run(&c, &probe, &Options::default(), &[churn_stage()], &mut SeededRng::new(2))
        .await
        .expect("run");
    assert_eq!(summary.checks_passed, 2);
    let seen = probe.seen.lock();
    assert_eq!(seen[0]["bee"], (5, 5));
    assert_eq!(seen[1]["bee"], (4, 3));
}

#[tokio::test]
async fn ping_between_stages_pushes_metrics() {
    let c = cluster(Arc::new(MockPlatform::new()), &[("bee", 3), ("drone", 3)]).await;
    let sink = Arc::new(MemorySink::new());
    let options = Options {
        retry: RetryConfig::fixed(2, Duration::ZERO),
        probe_timeout: Duration::from_secs(5),
        metrics_enabled: true,
        metrics: sink.clone(),
        ..Options::default()
    };
    let stages = vec![
        Stage::new(vec![Update::new("bee", Actions::new(1, 0, 1, 0))]),
        Stage::new(vec![Update::new("drone", Actions::new(0, 0, 0, 1))]),
    ];

    let summary = executor(CheckSchedule::EveryStage)
        .run(&c, &PingCheck::new(), &options, &stages, &mut SeededRng::new(5))
        .await
        .expect("run");

    assert_eq!(summary.checks_passed, 2);
    assert_eq!(sink.push_count(), 2);
    // after stage 0: 3 bee running + 3 drone = 6 nodes, 30 pairs
    // after stage 1: 3 bee running + 2 drone = 5 nodes, 20 pairs
    let totals: Vec<f64> = sink
        .named("hive_ping_pairs_total")
        .iter()
        .map(|o| o.value)
        .collect();
    assert_eq!(totals, vec![30.0, 20.0]);
}

#[tokio::test]
async fn pinning_survives_churn() {
    let c = cluster(Arc::new(MockPlatform::with_store_capacity(64)), &[("bee", 4)]).await;
    let options = Options {
        store_size: 32,
        store_size_divisor: 8,
        gc_wait: Duration::ZERO,
        retry: RetryConfig::fixed(2, Duration::ZERO),
        ..Options::default()
    };
    let stages = vec![
        Stage::new(vec![Update::new("bee", Actions::new(1, 0, 1, 1))]),
        Stage::new(vec![Update::new("bee", Actions::new(0, 1, 0, 0))]),
    ];
    let summary = executor(CheckSchedule::EveryStage)
        .run(&c, &PinningCheck::new(), &options, &stages, &mut SeededRng::new(8))
        .await
        .expect("run");
    assert_eq!(summary.checks_passed, 2);
    assert_eq!(summary.observation_count(), 4);
}

#[tokio::test]
async fn run_once_leaves_membership_alone() {
    let platform = Arc::new(MockPlatform::new());
    let c = cluster(platform.clone(), &[("bee", 3)]).await;
    let before = platform.calls().len();
    let probe = SizeProbe::default();
    let summary = executor(CheckSchedule::EveryStage)
        .run_once(&c, &probe, &Options::default(), &mut SeededRng::new(1))
        .await
        .expect("run once");
    assert_eq!(summary.checks_passed, 1);
    assert_eq!(summary.stages_applied, 0);
    assert_eq!(platform.calls().len(), before);
}
