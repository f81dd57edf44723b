//! Dependency-ordered application of the service's Kubernetes manifests.
//!
//! Later manifests reference names defined by earlier ones (the Deployment
//! mounts the Secret and ConfigMap, the Ingress routes to the Service), so the
//! order in [`ManifestKind::all`] is load-bearing.

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::runner::{CommandRunner, Invocation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// ManifestKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    Namespace,
    Secret,
    Config,
    Service,
    Workload,
    IngressControllerDaemon,
    IngressControllerServicePatch,
    Ingress,
}

impl ManifestKind {
    /// All kinds in apply order.
    pub fn all() -> &'static [ManifestKind] {
        &[
            ManifestKind::Namespace,
            ManifestKind::Secret,
            ManifestKind::Config,
            ManifestKind::Service,
            ManifestKind::Workload,
            ManifestKind::IngressControllerDaemon,
            ManifestKind::IngressControllerServicePatch,
            ManifestKind::Ingress,
        ]
    }

    /// 1-based apply position.
    pub fn position(self) -> usize {
        self as usize + 1
    }

    pub fn optional(self) -> bool {
        matches!(
            self,
            ManifestKind::Secret
                | ManifestKind::IngressControllerDaemon
                | ManifestKind::IngressControllerServicePatch
                | ManifestKind::Ingress
        )
    }

    pub fn default_file(self) -> &'static str {
        match self {
            ManifestKind::Namespace => "namespace.yaml",
            ManifestKind::Secret => "secret.yaml",
            ManifestKind::Config => "configmap.yaml",
            ManifestKind::Service => "service.yaml",
            ManifestKind::Workload => "deployment.yaml",
            ManifestKind::IngressControllerDaemon => "ingress-controller-daemonset.yaml",
            ManifestKind::IngressControllerServicePatch => "ingress-controller-service-patch.yaml",
            ManifestKind::Ingress => "ingress.yaml",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ManifestKind::Namespace => "namespace",
            ManifestKind::Secret => "secret",
            ManifestKind::Config => "config",
            ManifestKind::Service => "service",
            ManifestKind::Workload => "workload",
            ManifestKind::IngressControllerDaemon => "ingress_controller_daemon",
            ManifestKind::IngressControllerServicePatch => "ingress_controller_service_patch",
            ManifestKind::Ingress => "ingress",
        }
    }
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ResourceManifest / ApplyOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceManifest {
    pub kind: ManifestKind,
    pub path: PathBuf,
    pub optional: bool,
    pub present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    Skipped,
}

impl ApplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyStatus::Applied => "applied",
            ApplyStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub kind: ManifestKind,
    pub path: PathBuf,
    pub status: ApplyStatus,
}

/// Resolve every manifest against the configured directory, in apply order.
pub fn manifest_plan(config: &DeployConfig) -> Vec<ResourceManifest> {
    let dir = config.manifest_dir();
    ManifestKind::all()
        .iter()
        .map(|&kind| {
            let path = dir.join(config.cluster.manifest_file(kind));
            ResourceManifest {
                kind,
                present: path.is_file(),
                optional: kind.optional(),
                path,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ResourceApplicator
// ---------------------------------------------------------------------------

pub struct ResourceApplicator<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a DeployConfig,
}

impl<'a> ResourceApplicator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a DeployConfig) -> Self {
        Self { runner, config }
    }

    /// Apply `manifests` in their fixed order. Absent optional manifests are
    /// skipped; an absent required manifest fails before anything is applied.
    pub fn apply(&self, manifests: &[ResourceManifest]) -> Result<Vec<ApplyOutcome>> {
        let mut ordered: Vec<&ResourceManifest> = manifests.iter().collect();
        ordered.sort_by_key(|m| m.kind.position());

        if let Some(missing) = ordered.iter().find(|m| !m.optional && !m.present) {
            return Err(DeployError::ManifestMissing {
                kind: missing.kind.to_string(),
                path: missing.path.display().to_string(),
            });
        }

        let mut outcomes = Vec::with_capacity(ordered.len());
        for manifest in ordered {
            if !manifest.present {
                tracing::debug!(kind = %manifest.kind, path = %manifest.path.display(), "optional manifest absent, skipping");
                outcomes.push(ApplyOutcome {
                    kind: manifest.kind,
                    path: manifest.path.clone(),
                    status: ApplyStatus::Skipped,
                });
                continue;
            }

            let inv = self.invocation_for(manifest);
            let out = self.runner.run(&inv)?;
            if !out.success() {
                return Err(DeployError::ApplyFailed {
                    kind: manifest.kind.to_string(),
                    reason: out.failure_reason(),
                });
            }
            tracing::info!(
                step = manifest.kind.position(),
                kind = %manifest.kind,
                "{}",
                out.stdout.trim()
            );
            outcomes.push(ApplyOutcome {
                kind: manifest.kind,
                path: manifest.path.clone(),
                status: ApplyStatus::Applied,
            });
        }
        Ok(outcomes)
    }

    fn invocation_for(&self, manifest: &ResourceManifest) -> Invocation {
        let path = manifest.path.display().to_string();
        match manifest.kind {
            ManifestKind::IngressControllerServicePatch => Invocation::new("kubectl").args([
                "patch".to_string(),
                "service".to_string(),
                self.config.cluster.ingress_controller_service.clone(),
                "-n".to_string(),
                self.config.cluster.ingress_namespace.clone(),
                "--type".to_string(),
                "merge".to_string(),
                "--patch-file".to_string(),
                path,
            ]),
            _ => Invocation::new("kubectl").args(["apply", "-f", path.as_str()]),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::fixtures::{required, write_manifests};
    use super::*;
    use crate::runner::fake::{fail, FakeRunner};
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> DeployConfig {
        DeployConfig {
            root: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn order_and_optionality() {
        let positions: Vec<usize> = ManifestKind::all().iter().map(|k| k.position()).collect();
        assert_eq!(positions, [1, 2, 3, 4, 5, 6, 7, 8]);
        let optional: Vec<&str> = ManifestKind::all()
            .iter()
            .filter(|k| k.optional())
            .map(|k| k.as_str())
            .collect();
        assert_eq!(
            optional,
            ["secret", "ingress_controller_daemon", "ingress_controller_service_patch", "ingress"]
        );
    }

    #[test]
    fn applies_all_present_manifests_in_fixed_order() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_manifests(&config.manifest_dir(), ManifestKind::all());

        let runner = FakeRunner::new();
        let mut plan = manifest_plan(&config);
        plan.reverse();
        let outcomes = ResourceApplicator::new(&runner, &config).apply(&plan).unwrap();

        assert!(outcomes.iter().all(|o| o.status == ApplyStatus::Applied));
        let lines = runner.lines();
        assert_eq!(lines.len(), 8);
        let expected_files = [
            "namespace.yaml",
            "secret.yaml",
            "configmap.yaml",
            "service.yaml",
            "deployment.yaml",
            "ingress-controller-daemonset.yaml",
            "ingress-controller-service-patch.yaml",
            "ingress.yaml",
        ];
        for (line, file) in lines.iter().zip(expected_files) {
            assert!(line.ends_with(file), "{line} should target {file}");
        }
        assert!(lines[6].starts_with(
            "kubectl patch service ingress-nginx-controller -n ingress-nginx --type merge --patch-file"
        ));
        assert!(lines[0].starts_with("kubectl apply -f"));
    }

    #[test]
    fn absent_optional_manifests_are_skipped_silently() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_manifests(&config.manifest_dir(), &required());

        let runner = FakeRunner::new();
        let outcomes = ResourceApplicator::new(&runner, &config)
            .apply(&manifest_plan(&config))
            .unwrap();

        assert_eq!(outcomes.len(), 8);
        let skipped: Vec<ManifestKind> = outcomes
            .iter()
            .filter(|o| o.status == ApplyStatus::Skipped)
            .map(|o| o.kind)
            .collect();
        assert_eq!(
            skipped,
            [
                ManifestKind::Secret,
                ManifestKind::IngressControllerDaemon,
                ManifestKind::IngressControllerServicePatch,
                ManifestKind::Ingress
            ]
        );
        assert_eq!(runner.calls().len(), 4);
        assert_eq!(runner.count("ingress"), 0);
    }

    #[test]
    fn missing_required_manifest_fails_before_applying() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_manifests(
            &config.manifest_dir(),
            &[ManifestKind::Namespace, ManifestKind::Config, ManifestKind::Service],
        );

        let runner = FakeRunner::new();
        let err = ResourceApplicator::new(&runner, &config)
            .apply(&manifest_plan(&config))
            .unwrap_err();
        match err {
            DeployError::ManifestMissing { kind, .. } => assert_eq!(kind, "workload"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn apply_failure_stops_the_sequence() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write_manifests(&config.manifest_dir(), &required());

        let runner = FakeRunner::new().on(
            "configmap.yaml",
            fail(1, "error: error validating \"configmap.yaml\""),
        );
        let err = ResourceApplicator::new(&runner, &config)
            .apply(&manifest_plan(&config))
            .unwrap_err();
        assert!(matches!(err, DeployError::ApplyFailed { ref kind, .. } if kind == "config"));
        // namespace, then the failing config; service and workload never run.
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn file_name_override_is_honoured() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config
            .cluster
            .manifests
            .insert(ManifestKind::Ingress, PathBuf::from("ingress-prod.yaml"));
        write_manifests(&config.manifest_dir(), &required());
        std::fs::write(config.manifest_dir().join("ingress-prod.yaml"), "# prod\n").unwrap();

        let runner = FakeRunner::new();
        ResourceApplicator::new(&runner, &config)
            .apply(&manifest_plan(&config))
            .unwrap();
        assert_eq!(runner.count("ingress-prod.yaml"), 1);
    }
}
