use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("required command not found on PATH: {0}")]
    MissingCommand(String),

    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("cluster unreachable: {0}")]
    ClusterUnreachable(String),

    #[error("test suite failed: {0}")]
    TestsFailed(String),

    #[error("image build failed: {0}")]
    BuildFailed(String),

    #[error("required manifest '{kind}' not found at {path}")]
    ManifestMissing { kind: String, path: String },

    #[error("failed to apply manifest '{kind}': {reason}")]
    ApplyFailed { kind: String, reason: String },

    #[error("failed to restart deployment '{0}'")]
    RolloutRestartFailed(String),

    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("archive not found: {0}")]
    ArchiveNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;
