//! The container runtime capability.
//!
//! The cluster lifecycle is generic over [`ContainerRuntime`] so the state
//! machine can be exercised against a fake in tests. The shipped
//! implementation, [`DockerCli`], drives the local `docker` binary.

use async_trait::async_trait;

use crate::error::{Error, RuntimeError};

pub mod docker;

pub use docker::DockerCli;

/// One host-to-container port mapping, bound to 127.0.0.1 on the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortBinding {
    /// Port exposed on the host loopback interface.
    pub host_port: u16,
    /// Port the workload listens on inside the container.
    pub container_port: u16,
}

/// Everything needed to declare the cluster container.
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    /// Full image reference, e.g. `rancher/rancher:latest`.
    pub image: String,
    /// Container name; must be unique on the host.
    pub name: String,
    /// Whether the workload requires privileged mode.
    pub privileged: bool,
    /// Restart policy handed to the runtime, e.g. `unless-stopped`.
    pub restart_policy: Option<String>,
    /// Exposed port mappings.
    pub ports: Vec<PortBinding>,
}

impl ContainerSpec {
    /// Rejects specs that the runtime would accept but that cannot work,
    /// before any runtime call is made.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = std::collections::BTreeSet::new();
        for binding in &self.ports {
            if !seen.insert(binding.host_port) {
                return Err(Error::Config(format!(
                    "host port {} is mapped more than once",
                    binding.host_port
                )));
            }
        }
        Ok(())
    }
}

/// Operations the pipeline needs from a container runtime.
///
/// Every method carries its own bounded timeout inside the implementation,
/// so a hung runtime call cannot stall a poll past its own deadline.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pulls the image, discarding progress output.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Declares a container and returns its identifier.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Whether the runtime currently reports the container as running.
    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError>;

    /// Copies a path out of the container as a tar stream.
    ///
    /// Returns [`RuntimeError::NotFound`] while the path does not exist yet.
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, RuntimeError>;

    /// Stops a running container.
    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Removes a stopped container.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}
