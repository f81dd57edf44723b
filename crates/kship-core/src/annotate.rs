//! Recording why the workload changed, as its `kubernetes.io/change-cause`
//! annotation, derived from the latest commit when not given explicitly.

use crate::rollout::WorkloadRef;
use crate::runner::{CommandRunner, Invocation};
use serde::Serialize;
use std::path::Path;

pub const CHANGE_CAUSE_KEY: &str = "kubernetes.io/change-cause";

/// Used when neither an explicit message nor a commit subject is available.
pub const FALLBACK_CHANGE_CAUSE: &str = "Deployed via kship";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCauseSource {
    Override,
    Commit,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeAnnotation {
    pub message: String,
    pub source: ChangeCauseSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnnotationOutcome {
    Recorded { annotation: ChangeAnnotation },
    Failed { annotation: ChangeAnnotation, reason: String },
}

/// Subject line of the latest commit in `repo`, if there is one.
pub fn latest_commit_subject(runner: &dyn CommandRunner, repo: &Path) -> Option<String> {
    let inv = Invocation::new("git")
        .args(["log", "-1", "--pretty=%s"])
        .current_dir(repo);
    let out = runner.run(&inv).ok().filter(|o| o.success())?;
    let subject = out.stdout.lines().next().unwrap_or("").trim().to_string();
    (!subject.is_empty()).then_some(subject)
}

/// Explicit override, then the commit subject, then the fallback string.
pub fn resolve_change_cause(explicit: Option<&str>, commit_subject: Option<String>) -> ChangeAnnotation {
    if let Some(msg) = explicit.map(str::trim).filter(|m| !m.is_empty()) {
        return ChangeAnnotation {
            message: msg.to_string(),
            source: ChangeCauseSource::Override,
        };
    }
    match commit_subject {
        Some(subject) => ChangeAnnotation {
            message: subject,
            source: ChangeCauseSource::Commit,
        },
        None => ChangeAnnotation {
            message: FALLBACK_CHANGE_CAUSE.to_string(),
            source: ChangeCauseSource::Fallback,
        },
    }
}

pub struct ChangeRecorder<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> ChangeRecorder<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Attach `annotation` to the workload. Never fails the deployment.
    pub fn record(&self, workload: &WorkloadRef, annotation: ChangeAnnotation) -> AnnotationOutcome {
        let inv = Invocation::new("kubectl").args([
            "annotate".to_string(),
            workload.resource(),
            "-n".to_string(),
            workload.namespace.clone(),
            format!("{CHANGE_CAUSE_KEY}={}", annotation.message),
            "--overwrite".to_string(),
        ]);
        let failure = match self.runner.run(&inv) {
            Ok(out) if out.success() => None,
            Ok(out) => Some(out.failure_reason()),
            Err(e) => Some(e.to_string()),
        };
        match failure {
            None => {
                tracing::info!(workload = %workload, message = %annotation.message, "recorded change cause");
                AnnotationOutcome::Recorded { annotation }
            }
            Some(reason) => {
                tracing::warn!(workload = %workload, %reason, "could not record change cause");
                AnnotationOutcome::Failed { annotation, reason }
            }
        }
    }
}
