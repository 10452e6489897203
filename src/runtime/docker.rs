//! Driver for the local `docker` CLI.
//!
//! Each runtime call spawns one `docker` invocation under its own bounded
//! timeout and interprets the captured output. `docker cp <id>:<path> -`
//! streams a tar archive to stdout, which is exactly the shape the
//! kubeconfig extractor wants.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{ContainerRuntime, ContainerSpec};
use crate::error::RuntimeError;

/// A [`ContainerRuntime`] backed by the `docker` binary on `$PATH`.
#[derive(Clone, Debug)]
pub struct DockerCli {
    program: String,
    request_timeout: Duration,
}

/// Subset of `docker inspect` state the liveness poll cares about.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    #[serde(default)]
    running: bool,
    #[serde(default)]
    status: String,
}

impl DockerCli {
    /// Creates a driver invoking `docker` with the given per-call timeout.
    pub fn new(request_timeout: Duration) -> Self {
        DockerCli {
            program: "docker".to_string(),
            request_timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, RuntimeError> {
        let command = format!("{} {}", self.program, args.join(" "));
        debug!(%command, "invoking container runtime");
        let invocation = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output();
        let output = tokio::time::timeout(self.request_timeout, invocation)
            .await
            .map_err(|_| RuntimeError::RequestTimeout {
                command: command.clone(),
                timeout: self.request_timeout,
            })?
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr_means_not_found(&stderr) {
                return Err(RuntimeError::NotFound(stderr));
            }
            return Err(RuntimeError::CommandFailed {
                command,
                status: output.status,
                stderr,
            });
        }
        Ok(output.stdout)
    }

    async fn run_for_line(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let stdout = self.run(args).await?;
        let line = String::from_utf8_lossy(&stdout).trim().to_string();
        if line.is_empty() {
            return Err(RuntimeError::BadOutput {
                command: format!("{} {}", self.program, args.join(" ")),
                reason: "expected an identifier on stdout".to_string(),
            });
        }
        Ok(line)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.run(&["pull", image]).await.map(|_| ())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let args = create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_for_line(&args).await
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["start", id]).await.map(|_| ())
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        let command = format!("{} inspect {}", self.program, id);
        let stdout = self
            .run(&["inspect", "--format", "{{json .State}}", id])
            .await?;
        let state: ContainerState =
            serde_json::from_slice(&stdout).map_err(|err| RuntimeError::BadOutput {
                command,
                reason: format!("undecodable inspect state: {err}"),
            })?;
        debug!(container = %id, status = %state.status, "inspected container");
        Ok(state.running)
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError> {
        let source = format!("{id}:{path}");
        self.run(&["cp", &source, "-"]).await
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["stop", id]).await.map(|_| ())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["rm", id]).await.map(|_| ())
    }
}

fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
    if spec.privileged {
        args.push("--privileged".to_string());
    }
    if let Some(policy) = &spec.restart_policy {
        args.push("--restart".to_string());
        args.push(policy.clone());
    }
    for binding in &spec.ports {
        args.push("-p".to_string());
        args.push(format!(
            "127.0.0.1:{}:{}",
            binding.host_port, binding.container_port
        ));
    }
    args.push(spec.image.clone());
    args
}

/// The daemon phrases "it is not there" several ways depending on whether
/// the container or the path inside it is missing.
fn stderr_means_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container")
        || lower.contains("could not find the file")
        || lower.contains("no such file or directory")
}
