use crate::cmd::{ensure_valid, RUNNER};
use crate::output::{print_json, print_table, yes_no};
use clap::builder::BoolishValueParser;
use clap::Args;
use kship_core::annotate::AnnotationOutcome;
use kship_core::config::DeployConfig;
use kship_core::distribute::{DistributionResult, NodeOutcome};
use kship_core::pipeline::{DeployPlan, DeployReport, Pipeline, PipelineOptions};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Skip the test suite
    #[arg(long, env = "KSHIP_SKIP_TESTS", value_parser = BoolishValueParser::new())]
    pub skip_tests: bool,

    /// Skip `docker build` and save the image already in the local store
    #[arg(long, env = "KSHIP_SKIP_BUILD", value_parser = BoolishValueParser::new())]
    pub skip_build: bool,

    /// Distribute this archive instead of building one
    #[arg(long, env = "KSHIP_ARCHIVE")]
    pub archive: Option<PathBuf>,

    /// Change cause to record (default: latest commit subject)
    #[arg(long, env = "KSHIP_CHANGE_CAUSE")]
    pub change_cause: Option<String>,

    /// Seconds to wait for the rollout (default: rollout.timeout_secs)
    #[arg(long, value_name = "SECS")]
    pub rollout_timeout: Option<u64>,

    /// Keep the image archive after distribution
    #[arg(long)]
    pub keep_archive: bool,

    /// Print the plan and exit without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(mut config: DeployConfig, args: DeployArgs, json: bool) -> anyhow::Result<()> {
    if args.change_cause.is_some() {
        config.change_cause = args.change_cause;
    }
    if let Some(secs) = args.rollout_timeout {
        config.rollout.timeout_secs = secs;
    }
    ensure_valid(&config)?;

    let options = PipelineOptions {
        skip_tests: args.skip_tests,
        skip_build: args.skip_build,
        archive: args.archive,
        keep_archive: args.keep_archive,
        skip_preflight: false,
    };
    let pipeline = Pipeline::new(&RUNNER, &config, options);

    if args.dry_run {
        let plan = pipeline.plan()?;
        if json {
            print_json(&plan)?;
        } else {
            print_plan(&plan);
        }
        return Ok(());
    }

    let report = pipeline.run()?;
    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Human output
// ---------------------------------------------------------------------------

fn print_plan(plan: &DeployPlan) {
    println!("Image:     {}", plan.image);
    println!("Archive:   {}", plan.archive.display());
    println!("Build:     {}", yes_no(plan.build));
    match &plan.tests {
        Some(command) => println!("Tests:     {}", command.join(" ")),
        None => println!("Tests:     skipped"),
    }
    println!("Workload:  {}", plan.workload);
    println!("Cause:     {} ({:?})", plan.change_cause.message, plan.change_cause.source);
    println!();

    let rows = plan
        .nodes
        .iter()
        .map(|n| {
            vec![
                n.name.clone(),
                n.reach_address().unwrap_or("-").to_string(),
                yes_no(n.local),
            ]
        })
        .collect();
    print_table(&["NODE", "ADDRESS", "LOCAL"], rows);
    println!();

    let rows = plan
        .manifests
        .iter()
        .map(|m| {
            let state = match (m.present, m.optional) {
                (true, _) => "apply",
                (false, true) => "skip",
                (false, false) => "MISSING",
            };
            vec![
                m.kind.to_string(),
                m.path.display().to_string(),
                state.to_string(),
            ]
        })
        .collect();
    print_table(&["MANIFEST", "FILE", "ACTION"], rows);
}

pub fn node_rows(outcomes: &[NodeOutcome]) -> Vec<Vec<String>> {
    outcomes
        .iter()
        .map(|o| {
            let detail = match &o.result {
                DistributionResult::Imported => String::new(),
                DistributionResult::Skipped { reason } => reason.clone(),
                DistributionResult::Failed { reason, .. } => reason.clone(),
            };
            vec![
                o.node.name.clone(),
                o.node.reach_address().unwrap_or("-").to_string(),
                yes_no(o.node.local),
                o.result.label().to_string(),
                detail,
            ]
        })
        .collect()
}

/// Manual recovery commands for every failed node.
pub fn print_recovery(outcomes: &[NodeOutcome]) {
    for o in outcomes {
        if let DistributionResult::Failed { recovery, .. } = &o.result {
            if recovery.is_empty() {
                continue;
            }
            println!();
            println!("To load the image on {} by hand:", o.node.name);
            for line in recovery {
                println!("  {line}");
            }
        }
    }
}

fn print_report(report: &DeployReport) {
    println!("Image: {} ({})", report.image, report.artifact.archive.display());
    println!();
    print_table(
        &["NODE", "ADDRESS", "LOCAL", "RESULT", "DETAIL"],
        node_rows(&report.nodes),
    );
    print_recovery(&report.nodes);
    println!();

    let rows = report
        .manifests
        .iter()
        .map(|m| {
            vec![
                m.kind.to_string(),
                m.path.display().to_string(),
                m.status.as_str().to_string(),
            ]
        })
        .collect();
    print_table(&["MANIFEST", "FILE", "STATUS"], rows);
    println!();

    println!("Rollout: {}", report.rollout);
    match &report.annotation {
        AnnotationOutcome::Recorded { annotation } => {
            println!("Change cause: {}", annotation.message)
        }
        AnnotationOutcome::Failed { annotation, reason } => {
            println!("Change cause not recorded ({reason}): {}", annotation.message)
        }
    }

    let s = report.summary;
    println!();
    if report.has_warnings() {
        println!(
            "Deployed with warnings: {} imported, {} skipped, {} failed.",
            s.imported, s.skipped, s.failed
        );
    } else {
        println!("Deployed: {} imported, {} skipped.", s.imported, s.skipped);
    }
}
