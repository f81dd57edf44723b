use crate::cmd::RUNNER;
use crate::output::{print_json, print_table, yes_no};
use kship_core::config::DeployConfig;
use kship_core::pipeline::{Pipeline, PipelineOptions};

pub fn run(config: &DeployConfig, json: bool) -> anyhow::Result<()> {
    let pipeline = Pipeline::new(&RUNNER, config, PipelineOptions::default());
    pipeline.preflight(&["kubectl"])?;
    let nodes = pipeline.enumerate()?;

    if json {
        return print_json(&nodes);
    }
    if nodes.is_empty() {
        println!("No nodes.");
        return Ok(());
    }
    let skip = &config.remote.skip_nodes;
    let rows = nodes
        .iter()
        .map(|n| {
            vec![
                n.name.clone(),
                n.reach_address().unwrap_or("-").to_string(),
                yes_no(n.local),
                yes_no(skip.contains(&n.name)),
            ]
        })
        .collect();
    print_table(&["NODE", "ADDRESS", "LOCAL", "EXCLUDED"], rows);
    Ok(())
}
