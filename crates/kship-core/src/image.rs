//! Test gate, `docker build` and `docker save`.
//!
//! Everything here runs before the cluster is touched, and every failure is
//! fatal.

use crate::config::DeployConfig;
use crate::distribute::ImageArtifact;
use crate::error::{DeployError, Result};
use crate::runner::{CommandRunner, Invocation};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Archive file name for `name:tag`, safe for any filesystem.
pub fn archive_file_name(reference: &str) -> String {
    let stem: String = reference
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    format!("{stem}.tar")
}

pub struct ImageBuilder<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a DeployConfig,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a DeployConfig) -> Self {
        Self { runner, config }
    }

    /// Run the configured test suite in the project root. A no-op when no
    /// test command is configured.
    pub fn run_tests(&self) -> Result<()> {
        let Some((program, args)) = self.config.tests.command.split_first() else {
            tracing::debug!("no test command configured");
            return Ok(());
        };
        let inv = Invocation::new(program.as_str())
            .args(args.iter().map(String::as_str))
            .current_dir(&self.config.root)
            .timeout(self.config.tests.timeout_secs.map(Duration::from_secs));
        tracing::info!(command = %inv, "running test suite");
        let out = self.runner.run(&inv)?;
        if !out.success() {
            return Err(DeployError::TestsFailed(out.failure_reason()));
        }
        tracing::info!("test suite passed");
        Ok(())
    }

    pub fn build_invocation(&self) -> Invocation {
        let image = &self.config.image;
        let mut inv = Invocation::new("docker").args(["build", "-t"]).arg(image.reference());
        if let Some(dockerfile) = &image.dockerfile {
            inv = inv
                .arg("-f")
                .arg(self.config.resolve(dockerfile).display().to_string());
        }
        for (key, value) in &image.build_args {
            inv = inv.arg("--build-arg").arg(format!("{key}={value}"));
        }
        inv.arg(self.config.resolve(&image.context).display().to_string())
            .current_dir(&self.config.root)
    }

    /// `docker build` the configured image.
    pub fn build(&self) -> Result<()> {
        let inv = self.build_invocation();
        tracing::info!(image = %self.config.image.reference(), "building image");
        let out = self.runner.run(&inv)?;
        if !out.success() {
            return Err(DeployError::BuildFailed(out.failure_reason()));
        }
        Ok(())
    }

    pub fn archive_path(&self) -> PathBuf {
        let dir = self
            .config
            .image
            .archive_dir
            .as_deref()
            .map(|d| self.config.resolve(d))
            .unwrap_or_else(std::env::temp_dir);
        dir.join(archive_file_name(&self.config.image.reference()))
    }

    /// `docker save` the image into an archive kship owns.
    pub fn save(&self) -> Result<ImageArtifact> {
        let reference = self.config.image.reference();
        let archive = self.archive_path();
        if let Some(parent) = archive.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let inv = Invocation::new("docker")
            .args(["save", "-o"])
            .arg(archive.display().to_string())
            .arg(reference.as_str());
        let out = self.runner.run(&inv)?;
        if !out.success() {
            return Err(DeployError::BuildFailed(format!(
                "docker save failed: {}",
                out.failure_reason()
            )));
        }
        tracing::info!(image = %reference, archive = %archive.display(), "saved image archive");
        Ok(ImageArtifact::new(reference, archive, true))
    }

    /// Wrap an archive the operator supplied. It is never deleted.
    pub fn existing(&self, archive: &Path) -> Result<ImageArtifact> {
        let archive = self.config.resolve(archive);
        if !archive.is_file() {
            return Err(DeployError::ArchiveNotFound(archive.display().to_string()));
        }
        Ok(ImageArtifact::new(self.config.image.reference(), archive, false))
    }
}
