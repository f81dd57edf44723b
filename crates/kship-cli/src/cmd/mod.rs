pub mod annotate;
pub mod apply;
pub mod config;
pub mod deploy;
pub mod distribute;
pub mod nodes;
pub mod rollout;

use anyhow::Context;
use clap::Args;
use kship_core::config::DeployConfig;
use kship_core::runner::SystemRunner;
use std::path::Path;

pub static RUNNER: SystemRunner = SystemRunner;

/// Flags that override `kship.yaml` for every command.
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Image reference to build and distribute (NAME or NAME:TAG)
    #[arg(long, global = true, env = "KSHIP_IMAGE", value_name = "NAME:TAG")]
    pub image: Option<String>,

    /// Namespace of the workload
    #[arg(long, global = true, env = "KSHIP_NAMESPACE")]
    pub namespace: Option<String>,

    /// User for SSH and SCP to remote nodes (default: remote.user, then $USER)
    #[arg(long, global = true, env = "KSHIP_SSH_USER")]
    pub ssh_user: Option<String>,

    /// Nodes to load concurrently
    #[arg(long, global = true, value_name = "N")]
    pub parallelism: Option<usize>,
}

impl Overrides {
    pub fn apply(&self, config: &mut DeployConfig) {
        if let Some(image) = &self.image {
            let (name, tag) = split_image(image);
            config.image.name = name.to_string();
            if let Some(tag) = tag {
                config.image.tag = tag.to_string();
            }
        }
        if let Some(ns) = &self.namespace {
            config.cluster.namespace = ns.clone();
        }
        if let Some(user) = &self.ssh_user {
            config.remote.user = Some(user.clone());
        }
        if config.remote.user.is_none() {
            config.remote.user = std::env::var("USER").ok().filter(|u| !u.is_empty());
        }
        if let Some(n) = self.parallelism {
            config.remote.parallelism = n;
        }
    }
}

/// Split `NAME[:TAG]`. A colon before the last `/` belongs to a registry port.
pub fn split_image(reference: &str) -> (&str, Option<&str>) {
    let last_segment = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[last_segment..].rfind(':') {
        Some(i) => {
            let at = last_segment + i;
            (&reference[..at], Some(&reference[at + 1..]))
        }
        None => (reference, None),
    }
}

/// Load `kship.yaml`, apply overrides and read the credential from the
/// environment.
pub fn load_config(root: &Path, overrides: &Overrides) -> anyhow::Result<DeployConfig> {
    let mut config = DeployConfig::load(root).with_context(|| {
        format!(
            "failed to load {}",
            DeployConfig::config_path(root).display()
        )
    })?;
    overrides.apply(&mut config);
    Ok(config.with_password(DeployConfig::password_from_env()))
}

/// Log warnings and refuse to continue on validation errors.
pub fn ensure_valid(config: &DeployConfig) -> anyhow::Result<()> {
    for w in config.check()? {
        tracing::warn!("{}", w.message);
    }
    Ok(())
}
