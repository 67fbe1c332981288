//! `plan` command: print a stage plan as TOML with a per-stage digest.

use std::path::Path;

use anyhow::{Context, Result};
use hive_check::stage::StagePlan;

pub fn print_plan(path: Option<&Path>) -> Result<()> {
    let plan = match path {
        Some(p) => StagePlan::load(p).with_context(|| format!("loading stage plan {}", p.display()))?,
        None => StagePlan::default_plan(),
    };

    for (i, stage) in plan.stages.iter().enumerate() {
        let parts: Vec<String> = stage
            .updates
            .iter()
            .map(|u| {
                format!(
                    "{} +{} start {} stop {} delete {}",
                    u.node_group,
                    u.actions.add_count,
                    u.actions.start_count,
                    u.actions.stop_count,
                    u.actions.delete_count
                )
            })
            .collect();
        println!("# stage {}: {}", i, parts.join("; "));
    }
    let rendered = toml::to_string(&plan).context("rendering stage plan")?;
    print!("{}", rendered);
    Ok(())
}
