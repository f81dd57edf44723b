use crate::cmd::{ensure_valid, RUNNER};
use crate::output::print_json;
use kship_core::config::DeployConfig;
use kship_core::pipeline::{Pipeline, PipelineOptions};
use kship_core::rollout::RolloutState;

pub fn run(mut config: DeployConfig, timeout: Option<u64>, json: bool) -> anyhow::Result<()> {
    if let Some(secs) = timeout {
        config.rollout.timeout_secs = secs;
    }
    ensure_valid(&config)?;
    let pipeline = Pipeline::new(&RUNNER, &config, PipelineOptions::default());
    pipeline.preflight(&["kubectl"])?;
    let state = pipeline.rollout()?;

    if json {
        print_json(&serde_json::json!({
            "workload": pipeline.workload(),
            "state": state,
        }))?;
    } else {
        println!("{}: {state}", pipeline.workload());
        if state == RolloutState::TimedOut {
            println!(
                "Not available after {}s; the rollout may still converge.",
                config.rollout.timeout_secs
            );
        }
    }
    Ok(())
}
