//! The deployment as explicit stages:
//! preflight → tests → build → enumerate → distribute → apply → restart →
//! wait → record.
//!
//! Fatal errors return `Err` and stop the run where they happen. Per-node
//! distribution failures, a rollout timeout and a failed annotation are
//! reported in the [`DeployReport`] and logged as warnings.

use crate::annotate::{
    latest_commit_subject, resolve_change_cause, AnnotationOutcome, ChangeAnnotation,
    ChangeRecorder,
};
use crate::apply::{manifest_plan, ApplyOutcome, ResourceApplicator, ResourceManifest};
use crate::config::{DeployConfig, SshAuth};
use crate::distribute::{DistributionSummary, ImageArtifact, ImageDistributor, NodeOutcome};
use crate::error::Result;
use crate::image::ImageBuilder;
use crate::nodes::{LocalHost, Node, NodeEnumerator};
use crate::preflight::require_commands;
use crate::rollout::{RolloutState, RolloutWaiter, WorkloadRef};
use crate::runner::CommandRunner;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub skip_tests: bool,
    pub skip_build: bool,
    /// Use this archive instead of building and saving one.
    pub archive: Option<PathBuf>,
    pub keep_archive: bool,
    /// Skip the `which` checks. Used when the runner is not the real system.
    pub skip_preflight: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub image: String,
    pub artifact: ImageArtifact,
    pub nodes: Vec<NodeOutcome>,
    pub summary: DistributionSummary,
    pub manifests: Vec<ApplyOutcome>,
    pub rollout: RolloutState,
    pub annotation: AnnotationOutcome,
}

impl DeployReport {
    /// Anything an operator should look at, although the run succeeded.
    pub fn has_warnings(&self) -> bool {
        self.summary.failed > 0
            || self.rollout != RolloutState::Available
            || matches!(self.annotation, AnnotationOutcome::Failed { .. })
    }
}

/// What a run would do, without doing it.
#[derive(Debug, Clone, Serialize)]
pub struct DeployPlan {
    pub image: String,
    pub archive: PathBuf,
    pub build: bool,
    pub tests: Option<Vec<String>>,
    pub nodes: Vec<Node>,
    pub manifests: Vec<ResourceManifest>,
    pub workload: WorkloadRef,
    pub change_cause: ChangeAnnotation,
}

pub struct Pipeline<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a DeployConfig,
    options: PipelineOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a DeployConfig, options: PipelineOptions) -> Self {
        Self {
            runner,
            config,
            options,
        }
    }

    pub fn workload(&self) -> WorkloadRef {
        WorkloadRef::new(&self.config.cluster.namespace, &self.config.cluster.deployment)
    }

    fn builds(&self) -> bool {
        self.options.archive.is_none() && !self.options.skip_build
    }

    fn runs_tests(&self) -> bool {
        self.options.archive.is_none()
            && !self.options.skip_tests
            && !self.config.tests.command.is_empty()
    }

    pub fn preflight(&self, programs: &[&str]) -> Result<()> {
        if self.options.skip_preflight {
            return Ok(());
        }
        require_commands(programs)
    }

    /// Tools needed before the cluster is contacted.
    fn base_commands(&self) -> Vec<&'static str> {
        let mut programs = vec!["kubectl"];
        if self.options.archive.is_none() {
            programs.push("docker");
        }
        programs
    }

    /// Tools needed once the node set is known.
    fn node_commands(&self, nodes: &[Node]) -> Vec<&'static str> {
        let mut programs = Vec::new();
        if nodes.iter().any(|n| n.local) {
            programs.push("ctr");
            if self.config.runtime.sudo {
                programs.push("sudo");
            }
        }
        if nodes.iter().any(|n| !n.local && n.address.is_some()) {
            programs.extend(["ssh", "scp"]);
            if self.config.remote.auth == SshAuth::Password {
                programs.push("sshpass");
            }
        }
        programs
    }

    /// Check the tools needed to reach `nodes`.
    pub fn require_node_tools(&self, nodes: &[Node]) -> Result<()> {
        self.preflight(&self.node_commands(nodes))
    }

    pub fn enumerate(&self) -> Result<Vec<Node>> {
        let local = LocalHost::detect(self.runner, &self.config.remote.local_addresses);
        NodeEnumerator::new(self.runner, local).list()
    }

    pub fn change_annotation(&self) -> ChangeAnnotation {
        let subject = latest_commit_subject(self.runner, &self.config.root);
        resolve_change_cause(self.config.change_cause.as_deref(), subject)
    }

    /// Produce the artifact: an operator-supplied archive, or tests + build +
    /// save.
    pub fn prepare_artifact(&self) -> Result<ImageArtifact> {
        let builder = ImageBuilder::new(self.runner, self.config);
        if let Some(archive) = &self.options.archive {
            return builder.existing(archive);
        }
        if self.runs_tests() {
            builder.run_tests()?;
        }
        if self.builds() {
            builder.build()?;
        } else {
            tracing::info!(image = %self.config.image.reference(), "skipping build, saving existing image");
        }
        builder.save()
    }

    /// Distribute, then remove the archive once every node has concluded.
    pub fn distribute(&self, artifact: &ImageArtifact, nodes: &[Node]) -> Result<Vec<NodeOutcome>> {
        let outcomes = ImageDistributor::new(self.runner, self.config).distribute(artifact, nodes)?;
        let summary = DistributionSummary::of(&outcomes);
        if summary.failed > 0 {
            tracing::warn!(
                imported = summary.imported,
                skipped = summary.skipped,
                failed = summary.failed,
                "image distribution incomplete; continuing"
            );
        } else {
            tracing::info!(imported = summary.imported, skipped = summary.skipped, "image distribution complete");
        }

        if self.options.keep_archive {
            tracing::info!(archive = %artifact.archive.display(), "keeping image archive");
        } else if let Err(e) = artifact.cleanup() {
            tracing::warn!(archive = %artifact.archive.display(), error = %e, "could not remove image archive");
        }
        Ok(outcomes)
    }

    pub fn apply(&self) -> Result<Vec<ApplyOutcome>> {
        ResourceApplicator::new(self.runner, self.config).apply(&manifest_plan(self.config))
    }

    pub fn rollout(&self) -> Result<RolloutState> {
        let workload = self.workload();
        let waiter = RolloutWaiter::new(self.runner, self.config.poll_interval());
        waiter.restart(&workload)?;
        Ok(waiter.wait(&workload, self.config.rollout_deadline()))
    }

    pub fn record(&self) -> AnnotationOutcome {
        ChangeRecorder::new(self.runner).record(&self.workload(), self.change_annotation())
    }

    /// Run every stage.
    pub fn run(&self) -> Result<DeployReport> {
        let started_at = Utc::now();
        self.preflight(&self.base_commands())?;

        let artifact = self.prepare_artifact()?;
        let nodes = self.enumerate()?;
        self.require_node_tools(&nodes)?;

        let outcomes = self.distribute(&artifact, &nodes)?;
        let manifests = self.apply()?;
        let rollout = self.rollout()?;
        let annotation = self.record();

        Ok(DeployReport {
            started_at,
            finished_at: Utc::now(),
            image: self.config.image.reference(),
            artifact,
            summary: DistributionSummary::of(&outcomes),
            nodes: outcomes,
            manifests,
            rollout,
            annotation,
        })
    }

    /// Resolve everything a run would touch. Only read-only commands are
    /// issued.
    pub fn plan(&self) -> Result<DeployPlan> {
        let builder = ImageBuilder::new(self.runner, self.config);
        let archive = match &self.options.archive {
            Some(path) => self.config.resolve(path),
            None => builder.archive_path(),
        };
        Ok(DeployPlan {
            image: self.config.image.reference(),
            archive,
            build: self.builds(),
            tests: self.runs_tests().then(|| self.config.tests.command.clone()),
            nodes: self.enumerate()?,
            manifests: manifest_plan(self.config),
            workload: self.workload(),
            change_cause: self.change_annotation(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
