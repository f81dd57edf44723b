//! Restarting the workload and waiting for the new generation.

use crate::error::{DeployError, Result};
use crate::runner::{CommandRunner, Invocation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Pending,
    Progressing,
    Available,
    TimedOut,
}

impl RolloutState {
    pub fn as_str(self) -> &'static str {
        match self {
            RolloutState::Pending => "pending",
            RolloutState::Progressing => "progressing",
            RolloutState::Available => "available",
            RolloutState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `deployment/<name>` in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn resource(&self) -> String {
        format!("deployment/{}", self.name)
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Deployment status
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub metadata: DeploymentMetadata,
    #[serde(default)]
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: DeploymentStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeploymentMetadata {
    #[serde(default)]
    pub generation: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeploymentSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i64,
}

fn default_replicas() -> i64 {
    1
}

impl Default for DeploymentSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub replicas: i64,
    #[serde(default)]
    pub updated_replicas: i64,
    #[serde(default)]
    pub available_replicas: i64,
}

/// Classify a Deployment snapshot the way `kubectl rollout status` does.
pub fn classify(deployment: &Deployment) -> RolloutState {
    let desired = deployment.spec.replicas;
    let status = &deployment.status;
    if status.observed_generation < deployment.metadata.generation {
        return RolloutState::Pending;
    }
    if status.updated_replicas >= desired
        && status.replicas <= status.updated_replicas
        && status.available_replicas >= desired
    {
        RolloutState::Available
    } else {
        RolloutState::Progressing
    }
}

// ---------------------------------------------------------------------------
// RolloutWaiter
// ---------------------------------------------------------------------------

pub struct RolloutWaiter<'a> {
    runner: &'a dyn CommandRunner,
    poll_interval: Duration,
}

impl<'a> RolloutWaiter<'a> {
    pub fn new(runner: &'a dyn CommandRunner, poll_interval: Duration) -> Self {
        Self {
            runner,
            poll_interval,
        }
    }

    /// Trigger a new rollout generation.
    pub fn restart(&self, workload: &WorkloadRef) -> Result<()> {
        let inv = Invocation::new("kubectl").args([
            "rollout".to_string(),
            "restart".to_string(),
            workload.resource(),
            "-n".to_string(),
            workload.namespace.clone(),
        ]);
        let out = self.runner.run(&inv)?;
        if !out.success() {
            tracing::error!(workload = %workload, reason = %out.failure_reason(), "rollout restart failed");
            return Err(DeployError::RolloutRestartFailed(workload.to_string()));
        }
        tracing::info!(workload = %workload, "rollout restarted");
        Ok(())
    }

    /// Current state, or `Pending` when the Deployment cannot be read.
    pub fn observe(&self, workload: &WorkloadRef) -> RolloutState {
        let inv = Invocation::new("kubectl").args([
            "get".to_string(),
            "deployment".to_string(),
            workload.name.clone(),
            "-n".to_string(),
            workload.namespace.clone(),
            "-o".to_string(),
            "json".to_string(),
        ]);
        let out = match self.runner.run(&inv) {
            Ok(out) if out.success() => out,
            Ok(out) => {
                tracing::warn!(workload = %workload, reason = %out.failure_reason(), "rollout poll failed");
                return RolloutState::Pending;
            }
            Err(e) => {
                tracing::warn!(workload = %workload, error = %e, "rollout poll failed");
                return RolloutState::Pending;
            }
        };
        match serde_json::from_str::<Deployment>(&out.stdout) {
            Ok(d) => classify(&d),
            Err(e) => {
                tracing::warn!(workload = %workload, error = %e, "unparsable deployment status");
                RolloutState::Pending
            }
        }
    }

    /// Poll until `Available` or `deadline` elapses. Timing out is a result,
    /// not an error.
    pub fn wait(&self, workload: &WorkloadRef, deadline: Duration) -> RolloutState {
        let started = Instant::now();
        let mut last = None;
        loop {
            let state = self.observe(workload);
            if last != Some(state) {
                tracing::info!(workload = %workload, state = %state, "rollout status");
                last = Some(state);
            }
            if state == RolloutState::Available {
                return state;
            }
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                tracing::warn!(
                    workload = %workload,
                    waited_secs = elapsed.as_secs(),
                    "rollout did not complete before the deadline; it may still converge"
                );
                return RolloutState::TimedOut;
            }
            std::thread::sleep(self.poll_interval.min(deadline - elapsed));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::fixtures::deployment_json;
    use super::*;
    use crate::runner::fake::{fail, ok, FakeRunner};

    fn workload() -> WorkloadRef {
        WorkloadRef::new("unified-montrg", "unified-montrg")
    }

    fn parse(json: &str) -> Deployment {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn classify_generation_and_replicas() {
        assert_eq!(classify(&parse(&deployment_json(3, 2, 2, 2, 2, 2))), RolloutState::Pending);
        // Old replica set still has a pod.
        assert_eq!(classify(&parse(&deployment_json(3, 3, 2, 3, 2, 2))), RolloutState::Progressing);
        assert_eq!(classify(&parse(&deployment_json(3, 3, 2, 2, 1, 2))), RolloutState::Progressing);
        assert_eq!(classify(&parse(&deployment_json(3, 3, 2, 2, 2, 1))), RolloutState::Progressing);
        assert_eq!(classify(&parse(&deployment_json(3, 3, 2, 2, 2, 2))), RolloutState::Available);
    }

    #[test]
    fn classify_defaults_missing_fields() {
        // Fresh Deployment without a status block yet.
        let d = parse(r#"{"metadata":{"generation":1},"spec":{}}"#);
        assert_eq!(classify(&d), RolloutState::Pending);
    }

    #[test]
    fn restart_issues_rollout_restart() {
        let runner = FakeRunner::new();
        RolloutWaiter::new(&runner, Duration::ZERO)
            .restart(&workload())
            .unwrap();
        assert_eq!(
            runner.lines(),
            ["kubectl rollout restart deployment/unified-montrg -n unified-montrg"]
        );
    }

    #[test]
    fn restart_failure_is_fatal() {
        let runner = FakeRunner::new().on("rollout restart", fail(1, "deployments.apps \"unified-montrg\" not found"));
        let err = RolloutWaiter::new(&runner, Duration::ZERO)
            .restart(&workload())
            .unwrap_err();
        assert!(matches!(err, DeployError::RolloutRestartFailed(_)));
    }

    #[test]
    fn wait_returns_available_after_progressing() {
        let runner = FakeRunner::new().on_seq(
            "get deployment",
            vec![
                ok(&deployment_json(4, 3, 2, 2, 2, 2)),
                ok(&deployment_json(4, 4, 2, 3, 1, 2)),
                ok(&deployment_json(4, 4, 2, 2, 2, 2)),
            ],
        );
        let state = RolloutWaiter::new(&runner, Duration::ZERO).wait(&workload(), Duration::from_secs(60));
        assert_eq!(state, RolloutState::Available);
        assert_eq!(runner.count("get deployment"), 3);
    }

    #[test]
    fn wait_times_out_without_error() {
        let runner = FakeRunner::new().on("get deployment", ok(&deployment_json(4, 4, 2, 3, 1, 1)));
        let state = RolloutWaiter::new(&runner, Duration::from_millis(5))
            .wait(&workload(), Duration::from_millis(30));
        assert_eq!(state, RolloutState::TimedOut);
        assert!(runner.count("get deployment") >= 2);
    }

    #[test]
    fn zero_deadline_polls_once() {
        let runner = FakeRunner::new().on("get deployment", ok(&deployment_json(4, 3, 2, 2, 2, 2)));
        let state = RolloutWaiter::new(&runner, Duration::from_secs(5)).wait(&workload(), Duration::ZERO);
        assert_eq!(state, RolloutState::TimedOut);
        assert_eq!(runner.count("get deployment"), 1);
    }

    #[test]
    fn poll_failures_count_as_pending() {
        let runner = FakeRunner::new().on_seq(
            "get deployment",
            vec![fail(1, "Unable to connect to the server"), ok("not json"), ok(&deployment_json(1, 1, 1, 1, 1, 1))],
        );
        let waiter = RolloutWaiter::new(&runner, Duration::ZERO);
        assert_eq!(waiter.observe(&workload()), RolloutState::Pending);
        assert_eq!(waiter.observe(&workload()), RolloutState::Pending);
        assert_eq!(waiter.observe(&workload()), RolloutState::Available);
    }
}
