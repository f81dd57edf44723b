use crate::apply::ManifestKind;
use crate::error::{DeployError, Result};
use crate::runner::Secret;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

pub const CONFIG_FILE: &str = "kship.yaml";

/// Environment variable holding the SSH / sudo password for remote nodes.
pub const PASSWORD_ENV: &str = "KSHIP_SSH_PASSWORD";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ImageConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_name")]
    pub name: String,
    #[serde(default = "default_image_tag")]
    pub tag: String,
    /// Build context, relative to the project root.
    #[serde(default = "default_build_context")]
    pub context: PathBuf,
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
    #[serde(default = "default_build_args")]
    pub build_args: BTreeMap<String, String>,
    /// Directory the archive is written to. Defaults to the system temp dir.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
}

fn default_image_name() -> String {
    "unified-montrg".to_string()
}

fn default_image_tag() -> String {
    "latest".to_string()
}

fn default_build_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_build_args() -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert(
        "INSTANT_CLIENT_ZIP".to_string(),
        "instantclient-basic-linux.x64-21.13.0.0.0dbru.zip".to_string(),
    );
    m
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: default_image_name(),
            tag: default_image_tag(),
            context: default_build_context(),
            dockerfile: None,
            build_args: default_build_args(),
            archive_dir: None,
        }
    }
}

impl ImageConfig {
    /// `name:tag`, the name the Deployment references.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

// ---------------------------------------------------------------------------
// ClusterConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_namespace")]
    pub deployment: String,
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,
    /// Per-kind file name overrides, keyed by manifest kind
    /// (e.g. `ingress: ingress-prod.yaml`).
    #[serde(default)]
    pub manifests: BTreeMap<ManifestKind, PathBuf>,
    #[serde(default = "default_ingress_namespace")]
    pub ingress_namespace: String,
    #[serde(default = "default_ingress_service")]
    pub ingress_controller_service: String,
}

fn default_namespace() -> String {
    "unified-montrg".to_string()
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from("k8s")
}

fn default_ingress_namespace() -> String {
    "ingress-nginx".to_string()
}

fn default_ingress_service() -> String {
    "ingress-nginx-controller".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            deployment: default_namespace(),
            manifest_dir: default_manifest_dir(),
            manifests: BTreeMap::new(),
            ingress_namespace: default_ingress_namespace(),
            ingress_controller_service: default_ingress_service(),
        }
    }
}

impl ClusterConfig {
    pub fn manifest_file(&self, kind: ManifestKind) -> PathBuf {
        self.manifests
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(kind.default_file()))
    }
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// containerd namespace the kubelet reads images from.
    #[serde(default = "default_ctr_namespace")]
    pub ctr_namespace: String,
    /// Run `ctr` through `sudo`.
    #[serde(default = "default_true")]
    pub sudo: bool,
}

fn default_ctr_namespace() -> String {
    "k8s.io".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ctr_namespace: default_ctr_namespace(),
            sudo: default_true(),
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshAuth {
    /// `sshpass -e` with the password from `KSHIP_SSH_PASSWORD`.
    #[default]
    Password,
    /// Keys or ssh-agent; no password prompts allowed.
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub auth: SshAuth,
    #[serde(default = "default_remote_temp_dir")]
    pub temp_dir: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Upper bound for every single remote command (copy, import, ...).
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub skip_nodes: Vec<String>,
    /// Extra addresses that identify the control host.
    #[serde(default)]
    pub local_addresses: Vec<String>,
    #[serde(default = "default_true")]
    pub strict_host_key_checking: bool,
}

fn default_remote_temp_dir() -> String {
    "/tmp".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_node_timeout() -> u64 {
    600
}

fn default_parallelism() -> usize {
    1
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: None,
            auth: SshAuth::default(),
            temp_dir: default_remote_temp_dir(),
            connect_timeout_secs: default_connect_timeout(),
            node_timeout_secs: default_node_timeout(),
            parallelism: default_parallelism(),
            skip_nodes: Vec::new(),
            local_addresses: Vec::new(),
            strict_host_key_checking: default_true(),
        }
    }
}

impl RemoteConfig {
    pub fn node_timeout(&self) -> Option<Duration> {
        (self.node_timeout_secs > 0).then(|| Duration::from_secs(self.node_timeout_secs))
    }
}

// ---------------------------------------------------------------------------
// RolloutConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    #[serde(default = "default_rollout_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_rollout_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_rollout_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// TestsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestsConfig {
    /// Argument vector of the test suite, e.g. `[pytest, -q]`. Empty disables
    /// the gate.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// DeployConfig (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub tests: TestsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_cause: Option<String>,
    /// Project root all relative paths are resolved against. Set at load.
    #[serde(skip)]
    pub root: PathBuf,
    /// Never read from or written to the config file.
    #[serde(skip)]
    pub password: Option<Secret>,
}

fn default_version() -> u32 {
    1
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            image: ImageConfig::default(),
            cluster: ClusterConfig::default(),
            runtime: RuntimeConfig::default(),
            remote: RemoteConfig::default(),
            rollout: RolloutConfig::default(),
            tests: TestsConfig::default(),
            change_cause: None,
            root: PathBuf::from("."),
            password: None,
        }
    }
}

impl DeployConfig {
    pub fn config_path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }

    /// Load `kship.yaml` from `root`. A missing file yields the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        let mut cfg = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_yaml::from_str::<DeployConfig>(&data)?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            DeployConfig::default()
        };
        cfg.root = root.to_path_buf();
        Ok(cfg)
    }

    pub fn with_password(mut self, password: Option<Secret>) -> Self {
        self.password = password.filter(|p| !p.expose().is_empty());
        self
    }

    /// Read the remote password from `KSHIP_SSH_PASSWORD`.
    pub fn password_from_env() -> Option<Secret> {
        std::env::var(PASSWORD_ENV).ok().map(Secret::new)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.resolve(&self.cluster.manifest_dir)
    }

    pub fn rollout_deadline(&self) -> Duration {
        Duration::from_secs(self.rollout.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.rollout.poll_interval_secs)
    }

    /// Remote credential, required whenever password auth reaches a remote
    /// node. There is no fallback value.
    pub fn require_password(&self) -> Result<&Secret> {
        self.password.as_ref().ok_or_else(|| {
            DeployError::MissingCredential(format!(
                "remote nodes use password auth but {PASSWORD_ENV} is not set"
            ))
        })
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if !image_name_re().is_match(&self.image.name) {
            error(format!("invalid image name '{}'", self.image.name));
        }
        if !image_tag_re().is_match(&self.image.tag) {
            error(format!("invalid image tag '{}'", self.image.tag));
        }
        if self.cluster.namespace.trim().is_empty() {
            error("cluster.namespace is empty".to_string());
        }
        if self.cluster.deployment.trim().is_empty() {
            error("cluster.deployment is empty".to_string());
        }
        if self.remote.parallelism == 0 {
            error("remote.parallelism must be at least 1".to_string());
        }
        if self.rollout.poll_interval_secs == 0 {
            error("rollout.poll_interval_secs must be at least 1".to_string());
        }

        let mut warn = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message,
            })
        };

        if self.remote.node_timeout_secs == 0 {
            warn("remote.node_timeout_secs is 0: an unreachable node can stall distribution".into());
        }
        if self.remote.parallelism > 16 {
            warn(format!(
                "remote.parallelism={} (>16 is unusual)",
                self.remote.parallelism
            ));
        }
        if self.rollout.timeout_secs < self.rollout.poll_interval_secs {
            warn("rollout.timeout_secs is shorter than one poll interval".into());
        }
        if !self.remote.strict_host_key_checking {
            warn("remote.strict_host_key_checking is disabled".into());
        }
        if self.remote.auth == SshAuth::Password && self.password.is_none() {
            warn(format!(
                "{PASSWORD_ENV} is not set: distribution to remote nodes will fail"
            ));
        }
        if !self.manifest_dir().is_dir() {
            warn(format!(
                "manifest directory {} does not exist",
                self.manifest_dir().display()
            ));
        }

        warnings
    }

    /// Validate, returning the warnings, or `InvalidConfig` listing every
    /// error.
    pub fn check(&self) -> Result<Vec<ConfigWarning>> {
        let (errors, warnings): (Vec<_>, Vec<_>) = self
            .validate()
            .into_iter()
            .partition(|w| w.level == WarnLevel::Error);
        if !errors.is_empty() {
            let messages: Vec<String> = errors.into_iter().map(|w| w.message).collect();
            return Err(DeployError::InvalidConfig(messages.join("; ")));
        }
        Ok(warnings)
    }
}

static IMAGE_NAME_RE: OnceLock<Regex> = OnceLock::new();
static IMAGE_TAG_RE: OnceLock<Regex> = OnceLock::new();

fn image_name_re() -> &'static Regex {
    IMAGE_NAME_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?::[0-9]+)?(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
            .unwrap()
    })
}

fn image_tag_re() -> &'static Regex {
    IMAGE_TAG_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").unwrap())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
