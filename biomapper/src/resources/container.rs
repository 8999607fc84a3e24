//! Container-backed resources.
//!
//! [`ContainerProbe`] checks and starts a named container through a
//! [`ContainerRuntime`]. [`DockerCli`] is the runtime used outside tests; it
//! shells out to the `docker` binary.

use super::probe::{ProbeError, ProbeReport, ResourceProbe};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Observed state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Running.
    Running,
    /// Restarting after a crash.
    Restarting,
    /// Paused.
    Paused,
    /// Created or exited.
    Stopped,
    /// No container with that name exists.
    Absent,
}

impl ContainerState {
    fn from_docker_status(status: &str) -> Self {
        match status.trim() {
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            _ => Self::Stopped,
        }
    }
}

/// How to find or create a container. Read from the resource's `config`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerSpec {
    /// Container name.
    #[serde(alias = "name")]
    pub container_name: String,
    /// Image used when the container has to be created.
    #[serde(default)]
    pub image: Option<String>,
    /// Port mappings such as `"6333:6333"`.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra arguments passed after the image.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ContainerSpec {
    /// Reads a spec from a resource config blob.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::InvalidConfig` if `container_name` is missing.
    pub fn from_config(config: &serde_json::Value) -> Result<Self, ProbeError> {
        Self::deserialize(config).map_err(|e| ProbeError::InvalidConfig(e.to_string()))
    }
}

/// Operations a container engine must support.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the state of a container.
    async fn inspect(&self, name: &str) -> Result<ContainerState, ProbeError>;

    /// Starts an existing container.
    async fn start(&self, name: &str) -> Result<(), ProbeError>;

    /// Creates and starts a container.
    async fn run(&self, spec: &ContainerSpec) -> Result<(), ProbeError>;
}

/// Runtime driving the `docker` command line.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    /// Uses `docker` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different binary (for example `podman`).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn exec(&self, args: &[String]) -> Result<std::process::Output, ProbeError> {
        debug!(binary = %self.binary, ?args, "Running container command");
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::Command(format!("{}: {e}", self.binary)))
    }

    fn run_args(spec: &ContainerSpec) -> Result<Vec<String>, ProbeError> {
        let image = spec.image.as_ref().ok_or_else(|| {
            ProbeError::InvalidConfig(format!(
                "container '{}' is absent and no image is configured",
                spec.container_name
            ))
        })?;

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.container_name.clone(),
        ];
        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(image.clone());
        args.extend(spec.args.iter().cloned());
        Ok(args)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect(&self, name: &str) -> Result<ContainerState, ProbeError> {
        let args = [
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Status}}".to_string(),
            name.to_string(),
        ];
        let output = self.exec(&args).await?;
        if output.status.success() {
            let status = String::from_utf8_lossy(&output.stdout);
            return Ok(ContainerState::from_docker_status(&status));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such") {
            Ok(ContainerState::Absent)
        } else {
            Err(ProbeError::Command(stderr.trim().to_string()))
        }
    }

    async fn start(&self, name: &str) -> Result<(), ProbeError> {
        let output = self.exec(&["start".to_string(), name.to_string()]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProbeError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<(), ProbeError> {
        let output = self.exec(&Self::run_args(spec)?).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProbeError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// Probe for resources backed by a local container.
pub struct ContainerProbe {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerProbe {
    /// Creates a probe using the given runtime.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Creates a probe using the `docker` CLI.
    #[must_use]
    pub fn docker() -> Self {
        Self::new(Arc::new(DockerCli::new()))
    }
}

impl std::fmt::Debug for ContainerProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerProbe").finish_non_exhaustive()
    }
}

#[async_trait]
impl ResourceProbe for ContainerProbe {
    async fn check(&self, config: &serde_json::Value) -> Result<ProbeReport, ProbeError> {
        let spec = ContainerSpec::from_config(config)?;
        let state = self.runtime.inspect(&spec.container_name).await?;
        let details = serde_json::json!({
            "container": spec.container_name,
            "state": format!("{state:?}").to_lowercase(),
        });

        let report = match state {
            ContainerState::Running => ProbeReport::healthy().with_details(details),
            ContainerState::Restarting => ProbeReport::degraded("container is restarting"),
            ContainerState::Paused | ContainerState::Stopped => {
                ProbeReport::unavailable(format!("container '{}' is not running", spec.container_name))
            }
            ContainerState::Absent => {
                ProbeReport::unavailable(format!("container '{}' does not exist", spec.container_name))
            }
        };
        Ok(report)
    }

    async fn start(&self, config: &serde_json::Value) -> Result<bool, ProbeError> {
        let spec = ContainerSpec::from_config(config)?;
        match self.runtime.inspect(&spec.container_name).await? {
            ContainerState::Running => {}
            ContainerState::Absent => self.runtime.run(&spec).await?,
            ContainerState::Restarting | ContainerState::Paused | ContainerState::Stopped => {
                self.runtime.start(&spec.container_name).await?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceStatus;
    use mockall::predicate::eq;
    use serde_json::json;

    fn config() -> serde_json::Value {
        json!({
            "container_name": "qdrant",
            "image": "qdrant/qdrant:latest",
            "ports": ["6333:6333"],
            "env": {"QDRANT__LOG_LEVEL": "INFO"}
        })
    }

    #[test]
    fn test_run_args() {
        let spec = ContainerSpec::from_config(&config()).unwrap();
        let args = DockerCli::run_args(&spec).unwrap();
        assert_eq!(
            args,
            vec![
                "run", "-d", "--name", "qdrant", "-p", "6333:6333", "-e", "QDRANT__LOG_LEVEL=INFO",
                "qdrant/qdrant:latest"
            ]
        );

        let no_image = ContainerSpec::from_config(&json!({"name": "qdrant"})).unwrap();
        assert!(matches!(DockerCli::run_args(&no_image), Err(ProbeError::InvalidConfig(_))));
    }

    #[test]
    fn test_spec_requires_name() {
        assert!(ContainerSpec::from_config(&json!({"image": "x"})).is_err());
    }

    #[tokio::test]
    async fn test_check_maps_states() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_inspect()
            .with(eq("qdrant"))
            .times(1)
            .returning(|_| Ok(ContainerState::Stopped));
        let probe = ContainerProbe::new(Arc::new(runtime));

        let report = probe.check(&config()).await.unwrap();
        assert_eq!(report.status, ResourceStatus::Unavailable);
        assert!(report.details.unwrap()["error"].as_str().unwrap().contains("not running"));
    }

    #[tokio::test]
    async fn test_start_creates_absent_container() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_inspect().returning(|_| Ok(ContainerState::Absent));
        runtime.expect_run().times(1).returning(|_| Ok(()));
        runtime.expect_start().never();
        let probe = ContainerProbe::new(Arc::new(runtime));

        assert!(probe.start(&config()).await.unwrap());
    }

    #[tokio::test]
    async fn test_start_restarts_stopped_container() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_inspect().returning(|_| Ok(ContainerState::Stopped));
        runtime.expect_start().with(eq("qdrant")).times(1).returning(|_| Ok(()));
        runtime.expect_run().never();
        let probe = ContainerProbe::new(Arc::new(runtime));

        assert!(probe.start(&config()).await.unwrap());
    }
}
