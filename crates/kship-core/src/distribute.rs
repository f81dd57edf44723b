//! Loading an image archive into every node's container runtime.
//!
//! The control host imports the archive directly; every other node receives
//! it over `scp` and imports it over `ssh`. Each node is independent: a
//! failure is recorded as [`DistributionResult::Failed`] together with the
//! commands an operator can run by hand, and distribution moves on.
//!
//! Import is remove-then-import-then-tag. Re-pushing an existing tag with new
//! content would otherwise leave containerd's tag pointing at the old image.

use crate::config::{DeployConfig, SshAuth};
use crate::error::Result;
use crate::nodes::Node;
use crate::runner::{shell_quote, CommandOutput, CommandRunner, Invocation};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// ImageArtifact
// ---------------------------------------------------------------------------

/// A tagged image exported to an archive file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageArtifact {
    /// `name:tag` as referenced by the Deployment.
    pub reference: String,
    pub archive: PathBuf,
    /// Whether kship created the archive and may delete it.
    pub owned: bool,
}

impl ImageArtifact {
    pub fn new(reference: impl Into<String>, archive: impl Into<PathBuf>, owned: bool) -> Self {
        Self {
            reference: reference.into(),
            archive: archive.into(),
            owned,
        }
    }

    /// The name containerd gives the image when importing a `docker save`
    /// archive.
    pub fn runtime_reference(&self) -> String {
        qualify_reference(&self.reference)
    }

    /// Every name the image may already be registered under.
    fn names(&self) -> Vec<String> {
        let runtime = self.runtime_reference();
        if runtime == self.reference {
            vec![runtime]
        } else {
            vec![runtime, self.reference.clone()]
        }
    }

    pub fn file_name(&self) -> String {
        self.archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.tar".to_string())
    }

    /// Delete the archive if kship created it. Call only once every node's
    /// attempt has concluded.
    pub fn cleanup(&self) -> Result<()> {
        if self.owned && self.archive.exists() {
            std::fs::remove_file(&self.archive)?;
            tracing::info!(archive = %self.archive.display(), "removed image archive");
        }
        Ok(())
    }
}

/// Expand a short image reference the way the Docker daemon does:
/// `api:1` → `docker.io/library/api:1`, `team/api:1` → `docker.io/team/api:1`.
/// References that already name a registry are returned unchanged.
pub fn qualify_reference(reference: &str) -> String {
    match reference.split_once('/') {
        None => format!("docker.io/library/{reference}"),
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            reference.to_string()
        }
        Some(_) => format!("docker.io/{reference}"),
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DistributionResult {
    Imported,
    Skipped { reason: String },
    Failed { reason: String, recovery: Vec<String> },
}

impl DistributionResult {
    pub fn label(&self) -> &'static str {
        match self {
            DistributionResult::Imported => "imported",
            DistributionResult::Skipped { .. } => "skipped",
            DistributionResult::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeOutcome {
    pub node: Node,
    pub result: DistributionResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DistributionSummary {
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl DistributionSummary {
    pub fn of(outcomes: &[NodeOutcome]) -> Self {
        outcomes
            .iter()
            .fold(Self::default(), |mut acc, o| {
                match o.result {
                    DistributionResult::Imported => acc.imported += 1,
                    DistributionResult::Skipped { .. } => acc.skipped += 1,
                    DistributionResult::Failed { .. } => acc.failed += 1,
                }
                acc
            })
    }
}

/// Outcome of removing pre-existing image names before an import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Nothing to remove. Expected on a node's first deployment.
    Absent,
    Failed(String),
}

pub fn classify_remove(out: &CommandOutput) -> RemoveOutcome {
    if out.success() {
        return RemoveOutcome::Removed;
    }
    let text = format!("{}{}", out.stderr, out.stdout).to_ascii_lowercase();
    if !out.timed_out && text.contains("not found") {
        RemoveOutcome::Absent
    } else {
        RemoveOutcome::Failed(out.failure_reason())
    }
}

/// Outcome of binding the canonical name to the imported image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOutcome {
    Tagged,
    AlreadyTagged,
    /// The imported name already is the canonical name.
    NotNeeded,
    Failed(String),
}

pub fn classify_tag(out: &CommandOutput) -> TagOutcome {
    if out.success() {
        return TagOutcome::Tagged;
    }
    let text = format!("{}{}", out.stderr, out.stdout).to_ascii_lowercase();
    if !out.timed_out && text.contains("already exists") {
        TagOutcome::AlreadyTagged
    } else {
        TagOutcome::Failed(out.failure_reason())
    }
}

/// `ssh` exits 255 when the connection itself failed.
fn transport_failed(out: &CommandOutput) -> bool {
    out.timed_out || out.exit_code == Some(255)
}

/// `user@address` when a user is known, else the bare address.
pub fn connection_target(user: Option<&str>, address: &str) -> String {
    match user.filter(|u| !u.is_empty()) {
        Some(user) => format!("{user}@{address}"),
        None => address.to_string(),
    }
}

// ---------------------------------------------------------------------------
// ImageDistributor
// ---------------------------------------------------------------------------

pub struct ImageDistributor<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a DeployConfig,
}

impl<'a> ImageDistributor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a DeployConfig) -> Self {
        Self { runner, config }
    }

    /// Distribute `artifact` to `nodes`, returning one outcome per node in
    /// enumeration order. Only configuration problems are errors; per-node
    /// failures are outcomes.
    pub fn distribute(&self, artifact: &ImageArtifact, nodes: &[Node]) -> Result<Vec<NodeOutcome>> {
        if self.config.remote.auth == SshAuth::Password
            && nodes.iter().any(|n| self.needs_remote(n))
        {
            self.config.require_password()?;
        }

        let workers = self.config.remote.parallelism.clamp(1, nodes.len().max(1));
        tracing::info!(
            image = %artifact.reference,
            archive = %artifact.archive.display(),
            nodes = nodes.len(),
            workers,
            "distributing image"
        );

        let outcomes = if workers == 1 {
            nodes.iter().map(|n| self.distribute_one(artifact, n)).collect()
        } else {
            self.distribute_parallel(artifact, nodes, workers)
        };
        Ok(outcomes)
    }

    fn distribute_parallel(
        &self,
        artifact: &ImageArtifact,
        nodes: &[Node],
        workers: usize,
    ) -> Vec<NodeOutcome> {
        let next = AtomicUsize::new(0);
        let mut indexed: Vec<(usize, NodeOutcome)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(|| {
                        let mut done = Vec::new();
                        loop {
                            let i = next.fetch_add(1, Ordering::Relaxed);
                            let Some(node) = nodes.get(i) else { break };
                            done.push((i, self.distribute_one(artifact, node)));
                        }
                        done
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });
        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, o)| o).collect()
    }

    fn needs_remote(&self, node: &Node) -> bool {
        !node.local && node.address.is_some() && !self.is_excluded(node)
    }

    fn is_excluded(&self, node: &Node) -> bool {
        self.config.remote.skip_nodes.iter().any(|s| *s == node.name)
    }

    fn distribute_one(&self, artifact: &ImageArtifact, node: &Node) -> NodeOutcome {
        let result = if self.is_excluded(node) {
            DistributionResult::Skipped {
                reason: "excluded by configuration".to_string(),
            }
        } else if node.local {
            self.import_local(artifact, node)
        } else {
            match node.reach_address() {
                Some(address) => self.import_remote(artifact, node, address),
                None => DistributionResult::Skipped {
                    reason: "no internal address".to_string(),
                },
            }
        };

        match &result {
            DistributionResult::Imported => {
                tracing::info!(node = %node.name, local = node.local, "image imported")
            }
            DistributionResult::Skipped { reason } => {
                tracing::info!(node = %node.name, %reason, "node skipped")
            }
            DistributionResult::Failed { reason, recovery } => {
                tracing::warn!(node = %node.name, %reason, "image distribution failed; run manually:");
                for line in recovery {
                    tracing::warn!(node = %node.name, "  {line}");
                }
            }
        }

        NodeOutcome {
            node: node.clone(),
            result,
        }
    }

    fn exec(&self, inv: &Invocation) -> CommandOutput {
        self.runner.run(inv).unwrap_or_else(|e| CommandOutput {
            stderr: e.to_string(),
            ..Default::default()
        })
    }

    // -----------------------------------------------------------------------
    // Local import
    // -----------------------------------------------------------------------

    /// `ctr` on the control host, elevated as configured.
    fn local_ctr(&self, args: Vec<String>) -> Invocation {
        let ctr_args = self.ctr_args(args);
        if !self.config.runtime.sudo {
            return Invocation::new("ctr").args(ctr_args);
        }
        match &self.config.password {
            Some(pw) => Invocation::new("sudo")
                .args(["-S", "-p", "", "ctr"])
                .args(ctr_args)
                .stdin_secret(pw.clone()),
            None => Invocation::new("sudo").args(["-n", "ctr"]).args(ctr_args),
        }
    }

    fn ctr_args(&self, args: Vec<String>) -> Vec<String> {
        let mut v = vec!["-n".to_string(), self.config.runtime.ctr_namespace.clone()];
        v.extend(args);
        v
    }

    fn import_local(&self, artifact: &ImageArtifact, node: &Node) -> DistributionResult {
        let archive = artifact.archive.display().to_string();

        let rm = self.rm_args(artifact);
        log_remove(&node.name, classify_remove(&self.exec(&self.local_ctr(rm))));

        let out = self.exec(&self.local_ctr(vec!["images".into(), "import".into(), archive]));
        if !out.success() {
            return DistributionResult::Failed {
                reason: format!("import failed: {}", out.failure_reason()),
                recovery: self.local_recovery(artifact),
            };
        }

        let tag = self.tag_args(artifact).map(|args| classify_tag(&self.exec(&self.local_ctr(args))));
        log_tag(&node.name, tag.unwrap_or(TagOutcome::NotNeeded));
        DistributionResult::Imported
    }

    fn rm_args(&self, artifact: &ImageArtifact) -> Vec<String> {
        let mut args = vec!["images".to_string(), "rm".to_string()];
        args.extend(artifact.names());
        args
    }

    fn tag_args(&self, artifact: &ImageArtifact) -> Option<Vec<String>> {
        let runtime = artifact.runtime_reference();
        (runtime != artifact.reference).then(|| {
            vec![
                "images".to_string(),
                "tag".to_string(),
                "--force".to_string(),
                runtime,
                artifact.reference.clone(),
            ]
        })
    }

    fn local_recovery(&self, artifact: &ImageArtifact) -> Vec<String> {
        let archive = artifact.archive.display().to_string();
        let mut lines = vec![
            self.plain_ctr_line(self.rm_args(artifact)),
            self.plain_ctr_line(vec!["images".into(), "import".into(), archive]),
        ];
        if let Some(args) = self.tag_args(artifact) {
            lines.push(self.plain_ctr_line(args));
        }
        lines
    }

    /// Operator-facing `ctr` command line; sudo without stdin plumbing.
    fn plain_ctr_line(&self, args: Vec<String>) -> String {
        let mut words: Vec<String> = Vec::new();
        if self.config.runtime.sudo {
            words.push("sudo".into());
        }
        words.push("ctr".into());
        words.extend(self.ctr_args(args));
        join_quoted(&words)
    }

    // -----------------------------------------------------------------------
    // Remote import
    // -----------------------------------------------------------------------

    fn user(&self) -> Option<String> {
        self.config.remote.user.clone()
    }

    /// `scp`/`ssh`, wrapped in `sshpass -e` for password auth.
    fn transport(&self, program: &str) -> Invocation {
        let remote = &self.config.remote;
        let mut inv = match (remote.auth, &self.config.password) {
            (SshAuth::Password, Some(pw)) => Invocation::new("sshpass")
                .args(["-e", program])
                .secret_env("SSHPASS", pw.clone()),
            _ => Invocation::new(program),
        };
        inv = inv.args(["-o".to_string(), format!("ConnectTimeout={}", remote.connect_timeout_secs)]);
        if remote.auth == SshAuth::Agent {
            inv = inv.args(["-o", "BatchMode=yes"]);
        }
        if !remote.strict_host_key_checking {
            inv = inv.args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
            ]);
        }
        inv
    }

    /// A command run on `target` over ssh. Privileged commands get the
    /// password on stdin for `sudo -S`.
    fn remote(&self, target: &str, words: Vec<String>, privileged: bool) -> Invocation {
        let sudo = privileged && self.config.runtime.sudo;
        let mut full: Vec<String> = Vec::new();
        let mut stdin = None;
        if sudo {
            match (self.config.remote.auth, &self.config.password) {
                (SshAuth::Password, Some(pw)) => {
                    full.extend(["sudo", "-S", "-p", ""].map(String::from));
                    stdin = Some(pw.clone());
                }
                _ => full.extend(["sudo", "-n"].map(String::from)),
            }
        }
        full.extend(words);

        let inv = self
            .transport("ssh")
            .arg(target)
            .arg(join_quoted(&full));
        match stdin {
            Some(pw) => inv.stdin_secret(pw),
            None => inv,
        }
    }

    fn remote_ctr(&self, target: &str, args: Vec<String>) -> Invocation {
        let mut words = vec!["ctr".to_string()];
        words.extend(self.ctr_args(args));
        self.remote(target, words, true)
    }

    fn import_remote(&self, artifact: &ImageArtifact, node: &Node, address: &str) -> DistributionResult {
        let target = connection_target(self.user().as_deref(), address);
        let remote_path = remote_path(&self.config.remote.temp_dir, &artifact.file_name());
        let deadline = NodeDeadline::start(self.config.remote.node_timeout());
        let failed = |reason: String| DistributionResult::Failed {
            reason,
            recovery: self.remote_recovery(artifact, &target, &remote_path),
        };

        let copy = self
            .transport("scp")
            .arg(artifact.archive.display().to_string())
            .arg(format!("{target}:{remote_path}"));
        let out = self.exec_within(copy, &deadline);
        if !out.success() {
            return failed(format!("copy to {target} failed: {}", out.failure_reason()));
        }

        let rm = self.rm_args(artifact);
        let out = self.exec_within(self.remote_ctr(&target, rm), &deadline);
        if transport_failed(&out) {
            return failed(format!("remote session to {target} failed: {}", out.failure_reason()));
        }
        log_remove(&node.name, classify_remove(&out));

        let import = self.exec_within(
            self.remote_ctr(&target, vec!["images".into(), "import".into(), remote_path.clone()]),
            &deadline,
        );
        // A lost session or spent deadline leaves nothing to talk to.
        if transport_failed(&import) {
            return failed(format!("import on {target} failed: {}", import.failure_reason()));
        }

        let tag = if import.success() {
            self.tag_args(artifact)
                .map(|args| classify_tag(&self.exec_within(self.remote_ctr(&target, args), &deadline)))
        } else {
            None
        };

        let cleanup = self.exec_within(
            self.remote(&target, vec!["rm".into(), "-f".into(), remote_path.clone()], false),
            &deadline,
        );
        if !cleanup.success() {
            tracing::warn!(node = %node.name, path = %remote_path, reason = %cleanup.failure_reason(), "failed to remove remote archive");
        }

        if !import.success() {
            return failed(format!("import on {target} failed: {}", import.failure_reason()));
        }
        log_tag(&node.name, tag.unwrap_or(TagOutcome::NotNeeded));
        DistributionResult::Imported
    }

    /// Run one step of a remote import with whatever is left of the node's
    /// deadline. A spent deadline reports a timeout without running anything.
    fn exec_within(&self, inv: Invocation, deadline: &NodeDeadline) -> CommandOutput {
        match deadline.remaining() {
            Some(limit) => self.exec(&inv.timeout(limit)),
            None => CommandOutput {
                timed_out: true,
                ..Default::default()
            },
        }
    }

    fn remote_recovery(&self, artifact: &ImageArtifact, target: &str, remote_path: &str) -> Vec<String> {
        let ssh = |line: String| join_quoted(&["ssh".to_string(), target.to_string(), line]);
        let mut lines = vec![join_quoted(&[
            "scp".to_string(),
            artifact.archive.display().to_string(),
            format!("{target}:{remote_path}"),
        ])];
        lines.push(ssh(self.plain_ctr_line(self.rm_args(artifact))));
        lines.push(ssh(self.plain_ctr_line(vec![
            "images".into(),
            "import".into(),
            remote_path.to_string(),
        ])));
        if let Some(args) = self.tag_args(artifact) {
            lines.push(ssh(self.plain_ctr_line(args)));
        }
        lines.push(ssh(join_quoted(&["rm".into(), "-f".into(), remote_path.to_string()])));
        lines
    }
}

/// One time budget shared by every step of a node's remote import.
struct NodeDeadline(Option<Instant>);

impl NodeDeadline {
    fn start(limit: Option<Duration>) -> Self {
        Self(limit.map(|l| Instant::now() + l))
    }

    /// `Some(None)` when unbounded, `None` once the budget is spent.
    fn remaining(&self) -> Option<Option<Duration>> {
        match self.0 {
            None => Some(None),
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                (!left.is_zero()).then_some(Some(left))
            }
        }
    }
}

fn remote_path(temp_dir: &str, file_name: &str) -> String {
    let dir = temp_dir.trim_end_matches('/');
    let dir = if dir.is_empty() { "/tmp" } else { dir };
    Path::new(dir).join(file_name).display().to_string()
}

fn join_quoted(words: &[String]) -> String {
    words.iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" ")
}

fn log_remove(node: &str, outcome: RemoveOutcome) {
    match outcome {
        RemoveOutcome::Removed => tracing::debug!(node, "removed previous image"),
        RemoveOutcome::Absent => {}
        RemoveOutcome::Failed(reason) => {
            tracing::warn!(node, %reason, "could not remove previous image; importing anyway")
        }
    }
}

fn log_tag(node: &str, outcome: TagOutcome) {
    match outcome {
        TagOutcome::Tagged | TagOutcome::AlreadyTagged | TagOutcome::NotNeeded => {}
        TagOutcome::Failed(reason) => {
            tracing::warn!(node, %reason, "could not tag imported image")
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use crate::runner::fake::{fail, ok, FakeRunner};
    use crate::runner::Secret;

    fn node(name: &str, ip: &str, local: bool) -> Node {
        Node {
            name: name.into(),
            address: Some(ip.into()),
            hostname: None,
            local,
        }
    }

    fn cluster() -> Vec<Node> {
        vec![
            node("cp-01", "10.0.0.1", true),
            node("worker-a", "10.0.0.2", false),
            node("worker-b", "10.0.0.3", false),
        ]
    }

    fn config() -> DeployConfig {
        let mut cfg = DeployConfig::default().with_password(Some(Secret::new("pa55word")));
        cfg.remote.user = Some("deploy".into());
        cfg
    }

    fn artifact() -> ImageArtifact {
        ImageArtifact::new("unified-montrg:latest", "/var/tmp/unified-montrg-latest.tar", true)
    }

    fn statuses(outcomes: &[NodeOutcome]) -> Vec<&'static str> {
        outcomes.iter().map(|o| o.result.label()).collect()
    }

    #[test]
    fn qualify_reference_matches_docker_normalisation() {
        assert_eq!(qualify_reference("api:1"), "docker.io/library/api:1");
        assert_eq!(qualify_reference("team/api:1"), "docker.io/team/api:1");
        assert_eq!(qualify_reference("registry.local:5000/api:1"), "registry.local:5000/api:1");
        assert_eq!(qualify_reference("localhost/api:1"), "localhost/api:1");
    }

    #[test]
    fn classify_remove_distinguishes_absent_from_failure() {
        assert_eq!(classify_remove(&ok("")), RemoveOutcome::Removed);
        assert_eq!(
            classify_remove(&fail(1, "ctr: image \"docker.io/library/api:1\": not found")),
            RemoveOutcome::Absent
        );
        assert!(matches!(
            classify_remove(&fail(1, "ctr: permission denied")),
            RemoveOutcome::Failed(_)
        ));
    }

    #[test]
    fn classify_tag_accepts_existing_tag() {
        assert_eq!(classify_tag(&ok("")), TagOutcome::Tagged);
        assert_eq!(
            classify_tag(&fail(1, "ctr: image \"api:1\": already exists")),
            TagOutcome::AlreadyTagged
        );
        assert!(matches!(classify_tag(&fail(1, "boom")), TagOutcome::Failed(_)));
    }

    #[test]
    fn connection_target_prefers_user() {
        assert_eq!(connection_target(Some("deploy"), "10.0.0.2"), "deploy@10.0.0.2");
        assert_eq!(connection_target(Some(""), "10.0.0.2"), "10.0.0.2");
        assert_eq!(connection_target(None, "10.0.0.2"), "10.0.0.2");
    }

    #[test]
    fn all_healthy_nodes_are_imported() {
        let runner = FakeRunner::new();
        let cfg = config();
        let outcomes = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &cluster())
            .unwrap();

        assert_eq!(statuses(&outcomes), ["imported", "imported", "imported"]);
        let names: Vec<&str> = outcomes.iter().map(|o| o.node.name.as_str()).collect();
        assert_eq!(names, ["cp-01", "worker-a", "worker-b"]);

        let lines = runner.lines();
        // Local: rm, import, tag.
        assert_eq!(
            lines[0],
            "sudo -S -p '' ctr -n k8s.io images rm docker.io/library/unified-montrg:latest unified-montrg:latest"
        );
        assert_eq!(lines[1], "sudo -S -p '' ctr -n k8s.io images import /var/tmp/unified-montrg-latest.tar");
        assert_eq!(
            lines[2],
            "sudo -S -p '' ctr -n k8s.io images tag --force docker.io/library/unified-montrg:latest unified-montrg:latest"
        );
        // Remote: scp, rm, import, tag, cleanup per node.
        assert_eq!(
            lines[3],
            "sshpass -e scp -o ConnectTimeout=10 /var/tmp/unified-montrg-latest.tar deploy@10.0.0.2:/tmp/unified-montrg-latest.tar"
        );
        assert!(lines[5].starts_with("sshpass -e ssh -o ConnectTimeout=10 deploy@10.0.0.2 'sudo -S -p '\\'''\\'' ctr -n k8s.io images import /tmp/unified-montrg-latest.tar'"));
        assert_eq!(lines[7], "sshpass -e ssh -o ConnectTimeout=10 deploy@10.0.0.2 'rm -f /tmp/unified-montrg-latest.tar'");
        assert_eq!(lines.len(), 3 + 5 * 2);
    }

    #[test]
    fn credentials_travel_only_in_env_and_stdin() {
        let runner = FakeRunner::new();
        let cfg = config();
        ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &cluster())
            .unwrap();

        for inv in runner.calls() {
            assert!(!inv.command_line().contains("pa55word"));
            if inv.program == "sshpass" {
                assert!(inv
                    .env
                    .iter()
                    .any(|(k, v)| k == "SSHPASS" && *v == crate::runner::EnvValue::Secret(Secret::new("pa55word"))));
            }
        }
        let privileged = runner
            .calls()
            .into_iter()
            .filter(|i| i.command_line().contains("ctr -n"))
            .collect::<Vec<_>>();
        assert!(privileged.iter().all(|i| i.stdin.is_some()));
        let cleanup = runner
            .calls()
            .into_iter()
            .find(|i| i.command_line().contains("rm -f"))
            .unwrap();
        assert!(cleanup.stdin.is_none());
    }

    #[test]
    fn one_copy_failure_does_not_stop_other_nodes() {
        let runner = FakeRunner::new().on(
            "deploy@10.0.0.2:/tmp",
            fail(1, "ssh: connect to host 10.0.0.2 port 22: No route to host"),
        );
        let cfg = config();
        let outcomes = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &cluster())
            .unwrap();

        assert_eq!(statuses(&outcomes), ["imported", "failed", "imported"]);
        match &outcomes[1].result {
            DistributionResult::Failed { reason, recovery } => {
                assert!(reason.contains("No route to host"));
                assert_eq!(
                    recovery[0],
                    "scp /var/tmp/unified-montrg-latest.tar deploy@10.0.0.2:/tmp/unified-montrg-latest.tar"
                );
                assert_eq!(
                    recovery[1],
                    "ssh deploy@10.0.0.2 'sudo ctr -n k8s.io images rm docker.io/library/unified-montrg:latest unified-montrg:latest'"
                );
                assert_eq!(
                    recovery[2],
                    "ssh deploy@10.0.0.2 'sudo ctr -n k8s.io images import /tmp/unified-montrg-latest.tar'"
                );
                assert!(recovery.iter().all(|l| !l.contains("pa55word")));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // No retry and no remote session for the failed node.
        assert_eq!(runner.count("10.0.0.2"), 1);
        assert_eq!(DistributionSummary::of(&outcomes), DistributionSummary { imported: 2, skipped: 0, failed: 1 });
    }

    #[test]
    fn redistribution_of_existing_tag_is_idempotent() {
        // First run: nothing to remove. Second run: the old image is removed.
        let first = FakeRunner::new().on("images rm", fail(1, "ctr: image \"unified-montrg:latest\": not found"));
        let second = FakeRunner::new();
        let cfg = config();
        let only_local = vec![node("cp-01", "10.0.0.1", true)];

        for runner in [&first, &second] {
            let outcomes = ImageDistributor::new(runner, &cfg)
                .distribute(&artifact(), &only_local)
                .unwrap();
            assert_eq!(statuses(&outcomes), ["imported"]);
            assert_eq!(runner.count("images rm"), 1);
            assert_eq!(runner.count("images import"), 1);
            assert_eq!(runner.count("images tag --force"), 1);
        }
    }

    #[test]
    fn remote_import_failure_still_cleans_up() {
        let runner = FakeRunner::new().on(
            "10.0.0.3 'sudo -S -p '\\'''\\'' ctr -n k8s.io images import",
            fail(1, "ctr: unexpected EOF"),
        );
        let cfg = config();
        let outcomes = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &cluster())
            .unwrap();

        assert_eq!(statuses(&outcomes), ["imported", "imported", "failed"]);
        let lines = runner.lines();
        let last = lines.last().unwrap();
        assert!(last.contains("10.0.0.3 'rm -f /tmp/unified-montrg-latest.tar'"));
        // Tag is not attempted after a failed import.
        assert!(!lines.iter().any(|l| l.contains("10.0.0.3") && l.contains("images tag")));
    }

    #[test]
    fn unreachable_session_fails_node_without_import() {
        let runner = FakeRunner::new().on_match(
            |inv| inv.command_line().contains("deploy@10.0.0.2 ") && inv.command_line().contains("images rm"),
            vec![fail(255, "ssh: connect to host 10.0.0.2 port 22: Connection timed out")],
        );
        let cfg = config();
        let outcomes = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &cluster())
            .unwrap();
        assert_eq!(statuses(&outcomes), ["imported", "failed", "imported"]);
        assert!(!runner
            .lines()
            .iter()
            .any(|l| l.contains("deploy@10.0.0.2 ") && l.contains("images import")));
    }

    #[test]
    fn excluded_and_addressless_nodes_are_skipped() {
        let runner = FakeRunner::new();
        let mut cfg = config();
        cfg.remote.skip_nodes = vec!["worker-b".into()];
        let mut nodes = cluster();
        nodes[1].address = None;

        let outcomes = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &nodes)
            .unwrap();
        assert_eq!(statuses(&outcomes), ["imported", "skipped", "skipped"]);
        assert_eq!(runner.count("ssh"), 0);
    }

    #[test]
    fn missing_password_fails_fast_before_any_node() {
        let runner = FakeRunner::new();
        let cfg = DeployConfig::default();
        let err = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &cluster())
            .unwrap_err();
        assert!(matches!(err, DeployError::MissingCredential(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn local_only_cluster_needs_no_password() {
        let runner = FakeRunner::new();
        let cfg = DeployConfig::default();
        let outcomes = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &[node("cp-01", "10.0.0.1", true)])
            .unwrap();
        assert_eq!(statuses(&outcomes), ["imported"]);
        assert!(runner.lines()[0].starts_with("sudo -n ctr -n k8s.io"));
    }

    #[test]
    fn agent_auth_uses_batch_mode_without_sshpass() {
        let runner = FakeRunner::new();
        let mut cfg = DeployConfig::default();
        cfg.remote.auth = SshAuth::Agent;
        cfg.runtime.sudo = false;
        let outcomes = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &[node("worker-a", "10.0.0.2", false)])
            .unwrap();
        assert_eq!(statuses(&outcomes), ["imported"]);
        let lines = runner.lines();
        assert_eq!(
            lines[0],
            "scp -o ConnectTimeout=10 -o BatchMode=yes /var/tmp/unified-montrg-latest.tar 10.0.0.2:/tmp/unified-montrg-latest.tar"
        );
        assert_eq!(
            lines[2],
            "ssh -o ConnectTimeout=10 -o BatchMode=yes 10.0.0.2 'ctr -n k8s.io images import /tmp/unified-montrg-latest.tar'"
        );
        assert!(runner.calls().iter().all(|i| i.stdin.is_none()));
    }

    #[test]
    fn remote_steps_share_one_node_deadline() {
        let runner = FakeRunner::new();
        let mut cfg = config();
        cfg.remote.node_timeout_secs = 42;
        ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &[node("worker-a", "10.0.0.2", false)])
            .unwrap();
        let limits: Vec<Duration> = runner.calls().iter().map(|i| i.timeout.unwrap()).collect();
        assert_eq!(limits.len(), 5);
        assert!(limits.iter().all(|l| *l <= Duration::from_secs(42)));
        // Each step gets what the previous ones left over.
        assert!(limits.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn unbounded_node_timeout_sets_no_limit() {
        let runner = FakeRunner::new();
        let mut cfg = config();
        cfg.remote.node_timeout_secs = 0;
        ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &[node("worker-a", "10.0.0.2", false)])
            .unwrap();
        assert!(runner.calls().iter().all(|i| i.timeout.is_none()));
    }

    #[test]
    fn timed_out_import_stops_remote_calls() {
        let runner = FakeRunner::new().on_match(
            |inv| inv.program == "sshpass" && inv.command_line().contains("images import"),
            vec![CommandOutput {
                timed_out: true,
                ..Default::default()
            }],
        );
        let cfg = config();
        let outcomes = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &[node("worker-a", "10.0.0.2", false)])
            .unwrap();

        match &outcomes[0].result {
            DistributionResult::Failed { reason, recovery } => {
                assert!(reason.contains("timed out"));
                assert!(recovery.last().unwrap().contains("rm -f /tmp/unified-montrg-latest.tar"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // scp, images rm, images import and nothing after.
        let lines = runner.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains("images import"));
        assert_eq!(runner.count("rm -f"), 0);
        assert_eq!(runner.count("images tag"), 0);
    }

    #[test]
    fn recovery_removes_old_image_before_import() {
        let runner = FakeRunner::new().on("images import", fail(1, "ctr: unexpected EOF"));
        let cfg = config();
        let nodes = [node("cp-01", "10.0.0.1", true), node("worker-a", "10.0.0.2", false)];
        let outcomes = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &nodes)
            .unwrap();

        for outcome in &outcomes {
            let DistributionResult::Failed { recovery, .. } = &outcome.result else {
                panic!("expected failure for {}", outcome.node.name);
            };
            let rm = recovery.iter().position(|l| l.contains("images rm")).unwrap();
            let import = recovery.iter().position(|l| l.contains("images import")).unwrap();
            assert!(rm < import);
        }
        let DistributionResult::Failed { recovery, .. } = &outcomes[0].result else {
            unreachable!()
        };
        assert_eq!(
            recovery[0],
            "sudo ctr -n k8s.io images rm docker.io/library/unified-montrg:latest unified-montrg:latest"
        );
    }

    #[test]
    fn parallel_distribution_keeps_enumeration_order() {
        let runner = FakeRunner::new().on("deploy@10.0.0.4:/tmp", fail(1, "lost connection"));
        let mut cfg = config();
        cfg.remote.parallelism = 3;
        let nodes: Vec<Node> = (1..=6)
            .map(|i| node(&format!("n{i}"), &format!("10.0.0.{i}"), i == 1))
            .collect();

        let outcomes = ImageDistributor::new(&runner, &cfg)
            .distribute(&artifact(), &nodes)
            .unwrap();
        let names: Vec<&str> = outcomes.iter().map(|o| o.node.name.as_str()).collect();
        assert_eq!(names, ["n1", "n2", "n3", "n4", "n5", "n6"]);
        assert_eq!(
            statuses(&outcomes),
            ["imported", "imported", "imported", "failed", "imported", "imported"]
        );
    }

    #[test]
    fn cleanup_only_removes_owned_archives() {
        let dir = tempfile::TempDir::new().unwrap();
        let owned = dir.path().join("owned.tar");
        let foreign = dir.path().join("foreign.tar");
        std::fs::write(&owned, b"x").unwrap();
        std::fs::write(&foreign, b"x").unwrap();

        ImageArtifact::new("api:1", &owned, true).cleanup().unwrap();
        ImageArtifact::new("api:1", &foreign, false).cleanup().unwrap();
        assert!(!owned.exists());
        assert!(foreign.exists());
    }
}
