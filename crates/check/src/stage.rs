//! Stage plans and assignment planning.
//!
//! A [`Stage`] is a list of per-group [`Update`]s. Before a stage is applied
//! [`plan_stage`] turns each update's counts into concrete
//! `(group, node, action)` [`Assignment`]s:
//!
//! - starts prefer members that are not running, then running ones
//! - stops prefer running members not picked to start, then stopped ones
//! - deletes prefer members not picked for anything else, then take over
//!   picked ones (a deleted node needs no start or stop)
//! - adds take fresh `{group}-{n}` names from a per-group counter
//!
//! Each count only has to fit the group size, and a stage always leaves a
//! group at `size + add - delete` members. Starting a running member or
//! stopping a stopped one is a no-op. Candidates are ordered by node index
//! and then shuffled with the run's generator, so a seed reproduces the same
//! picks. Within a stage every assignment targets a distinct node.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use hive_cluster::Cluster;
use hive_common::config::{load_toml, parse_toml, ConfigError};
use hive_common::SeededRng;
use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════════════════
// PLAN MODEL
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Actions {
    pub add_count: usize,
    pub start_count: usize,
    pub stop_count: usize,
    pub delete_count: usize,
}

impl Actions {
    pub fn new(add_count: usize, start_count: usize, stop_count: usize, delete_count: usize) -> Self {
        Self {
            add_count,
            start_count,
            stop_count,
            delete_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub node_group: String,
    #[serde(flatten)]
    pub actions: Actions,
}

impl Update {
    pub fn new(node_group: impl Into<String>, actions: Actions) -> Self {
        Self {
            node_group: node_group.into(),
            actions,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default)]
    pub updates: Vec<Update>,
}

impl Stage {
    pub fn new(updates: Vec<Update>) -> Self {
        Self { updates }
    }
}

/// Ordered list of stages, loadable from TOML:
///
/// ```toml
/// [[stages]]
/// [[stages.updates]]
/// node_group = "bee"
/// add_count = 2
/// stop_count = 1
/// delete_count = 3
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    #[serde(default)]
    pub stages: Vec<Stage>,
}

impl StagePlan {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let plan: StagePlan = parse_toml(s, "<stage plan>")?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let plan: StagePlan = load_toml(path)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Each group may appear at most once per stage.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, stage) in self.stages.iter().enumerate() {
            let mut seen = HashSet::new();
            for u in &stage.updates {
                if u.node_group.is_empty() {
                    return Err(ConfigError::Invalid(format!("stage {}: empty node_group", i)));
                }
                if !seen.insert(u.node_group.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "stage {}: node group {} updated twice",
                        i, u.node_group
                    )));
                }
            }
        }
        Ok(())
    }

    /// Groups referenced by any stage.
    pub fn groups(&self) -> BTreeSet<&str> {
        self.stages
            .iter()
            .flat_map(|s| s.updates.iter().map(|u| u.node_group.as_str()))
            .collect()
    }

    /// The built-in three-stage churn plan over `bee` and `drone`.
    pub fn default_plan() -> Self {
        let stage = |bee: Actions, drone: Actions| {
            Stage::new(vec![Update::new("bee", bee), Update::new("drone", drone)])
        };
        Self {
            stages: vec![
                stage(Actions::new(2, 0, 1, 3), Actions::new(4, 0, 3, 1)),
                stage(Actions::new(3, 1, 1, 3), Actions::new(2, 1, 2, 1)),
                stage(Actions::new(4, 1, 3, 1), Actions::new(3, 1, 2, 1)),
            ],
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ASSIGNMENTS
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    Add,
    Start,
    Stop,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Add => write!(f, "add"),
            Action::Start => write!(f, "start"),
            Action::Stop => write!(f, "stop"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// One membership operation on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub stage: usize,
    pub group: String,
    pub node: String,
    pub action: Action,
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {}: {} {}/{}", self.stage, self.action, self.group, self.node)
    }
}

/// Why a stage cannot be planned against the current membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanError {
    pub stage: usize,
    pub group: String,
    pub reason: String,
}

/// Per-group counters for fresh node names; lives for the whole run.
#[derive(Debug, Default, Clone)]
pub struct NameCounters {
    next: HashMap<String, usize>,
}

impl NameCounters {
    fn fresh(&mut self, group: &str, taken: impl Fn(&str) -> bool) -> String {
        let counter = self.next.entry(group.to_string()).or_insert(0);
        loop {
            let name = format!("{}-{}", group, counter);
            *counter += 1;
            if !taken(&name) {
                return name;
            }
        }
    }
}

fn pick(rng: &mut SeededRng, mut candidates: Vec<String>, count: usize) -> Vec<String> {
    rng.shuffle(&mut candidates);
    candidates.truncate(count);
    candidates
}

/// Pick `count` names from `preferred`, topping up from `fallback` when
/// `preferred` runs short. The fallback is only shuffled when needed.
fn pick_preferring(
    rng: &mut SeededRng,
    preferred: Vec<String>,
    fallback: Vec<String>,
    count: usize,
) -> Vec<String> {
    let mut out = pick(rng, preferred, count);
    if out.len() < count {
        let short = count - out.len();
        out.extend(pick(rng, fallback, short));
    }
    out
}

fn without(names: Vec<String>, taken: &[String]) -> Vec<String> {
    names.into_iter().filter(|n| !taken.contains(n)).collect()
}

/// Turn stage `index` into assignments against the cluster's current
/// membership. Fails without side effects if any update cannot be satisfied.
pub fn plan_stage(
    index: usize,
    stage: &Stage,
    cluster: &Cluster,
    counters: &mut NameCounters,
    rng: &mut SeededRng,
) -> Result<Vec<Assignment>, PlanError> {
    let mut out = Vec::new();

    for update in &stage.updates {
        let fail = |reason: String| PlanError {
            stage: index,
            group: update.node_group.clone(),
            reason,
        };
        let group = cluster
            .node_group(&update.node_group)
            .map_err(|e| fail(e.to_string()))?;
        let a = update.actions;

        let size = group.size();
        for (action, count) in [
            ("start", a.start_count),
            ("stop", a.stop_count),
            ("delete", a.delete_count),
        ] {
            if count > size {
                return Err(fail(format!("{} {} exceeds group size {}", action, count, size)));
            }
        }

        let running = group.running_names();
        let stopped = group.stopped_names();

        let mut to_start = pick_preferring(rng, stopped.clone(), running.clone(), a.start_count);

        // a stop that cannot find a free member takes one away from the starts
        let mut to_stop = pick_preferring(
            rng,
            without(running, &to_start),
            without(stopped, &to_start),
            a.stop_count,
        );
        if to_stop.len() < a.stop_count {
            let moved = pick(rng, to_start.clone(), a.stop_count - to_stop.len());
            to_start.retain(|n| !moved.contains(n));
            to_stop.extend(moved);
        }

        let picked: Vec<String> = to_start.iter().chain(to_stop.iter()).cloned().collect();
        let to_delete = pick_preferring(
            rng,
            without(group.node_names(), &picked),
            picked,
            a.delete_count,
        );
        to_start.retain(|n| !to_delete.contains(n));
        to_stop.retain(|n| !to_delete.contains(n));

        let to_add: Vec<String> = (0..a.add_count)
            .map(|_| counters.fresh(&update.node_group, |n| group.contains(n)))
            .collect();

        let assign = |names: Vec<String>, action: Action| {
            names.into_iter().map(move |node| Assignment {
                stage: index,
                group: update.node_group.clone(),
                node,
                action,
            })
        };
        out.extend(assign(to_add, Action::Add));
        out.extend(assign(to_start, Action::Start));
        out.extend(assign(to_stop, Action::Stop));
        out.extend(assign(to_delete, Action::Delete));
    }

    Ok(out)
}
