use crate::cmd::RUNNER;
use crate::output::print_json;
use kship_core::annotate::AnnotationOutcome;
use kship_core::config::DeployConfig;
use kship_core::pipeline::{Pipeline, PipelineOptions};

pub fn run(mut config: DeployConfig, change_cause: Option<String>, json: bool) -> anyhow::Result<()> {
    if change_cause.is_some() {
        config.change_cause = change_cause;
    }
    let pipeline = Pipeline::new(&RUNNER, &config, PipelineOptions::default());
    pipeline.preflight(&["kubectl"])?;
    let outcome = pipeline.record();

    if json {
        print_json(&outcome)?;
    }
    match outcome {
        AnnotationOutcome::Recorded { annotation } => {
            if !json {
                println!("{}: {}", pipeline.workload(), annotation.message);
            }
            Ok(())
        }
        AnnotationOutcome::Failed { reason, .. } => {
            anyhow::bail!("could not annotate {}: {reason}", pipeline.workload())
        }
    }
}
