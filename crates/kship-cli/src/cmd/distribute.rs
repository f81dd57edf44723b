use crate::cmd::deploy::{node_rows, print_recovery};
use crate::cmd::{ensure_valid, RUNNER};
use crate::output::{print_json, print_table};
use kship_core::config::DeployConfig;
use kship_core::distribute::DistributionSummary;
use kship_core::pipeline::{Pipeline, PipelineOptions};
use std::path::PathBuf;

pub fn run(config: &DeployConfig, archive: PathBuf, json: bool) -> anyhow::Result<()> {
    ensure_valid(config)?;
    let options = PipelineOptions {
        archive: Some(archive),
        keep_archive: true,
        ..Default::default()
    };
    let pipeline = Pipeline::new(&RUNNER, config, options);
    pipeline.preflight(&["kubectl"])?;

    let artifact = pipeline.prepare_artifact()?;
    let nodes = pipeline.enumerate()?;
    pipeline.require_node_tools(&nodes)?;
    let outcomes = pipeline.distribute(&artifact, &nodes)?;
    let summary = DistributionSummary::of(&outcomes);

    if json {
        print_json(&serde_json::json!({
            "artifact": artifact,
            "nodes": outcomes,
            "summary": summary,
        }))?;
    } else {
        print_table(
            &["NODE", "ADDRESS", "LOCAL", "RESULT", "DETAIL"],
            node_rows(&outcomes),
        );
        print_recovery(&outcomes);
    }

    if summary.failed > 0 {
        anyhow::bail!("image load failed on {} node(s)", summary.failed);
    }
    Ok(())
}
