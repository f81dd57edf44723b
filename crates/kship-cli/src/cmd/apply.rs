use crate::cmd::{ensure_valid, RUNNER};
use crate::output::{print_json, print_table};
use kship_core::config::DeployConfig;
use kship_core::pipeline::{Pipeline, PipelineOptions};

pub fn run(config: &DeployConfig, json: bool) -> anyhow::Result<()> {
    ensure_valid(config)?;
    let pipeline = Pipeline::new(&RUNNER, config, PipelineOptions::default());
    pipeline.preflight(&["kubectl"])?;
    let outcomes = pipeline.apply()?;

    if json {
        return print_json(&outcomes);
    }
    let rows = outcomes
        .iter()
        .map(|o| {
            vec![
                o.kind.to_string(),
                o.path.display().to_string(),
                o.status.as_str().to_string(),
            ]
        })
        .collect();
    print_table(&["MANIFEST", "FILE", "STATUS"], rows);
    Ok(())
}
