//! Lifecycle of the disposable cluster container.
//!
//! [`ClusterContainer`] walks the runtime through
//! `Init -> ImagePulled -> Created -> Started -> Ready -> Stopped` without
//! skipping a state, extracts the kubeconfig the embedded API server writes
//! inside the container, and tears everything down best-effort on the way
//! out. Readiness here means "the runtime reports the container running";
//! application readiness is established later by the discovery gate.

use std::io::Read;
use std::time::Duration;

use kube::config::Kubeconfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::wait::{self, Attempt};

/// Knobs for the container polls and the endpoint rewrite.
#[derive(Clone, Debug)]
pub struct ClusterSettings {
    /// Host port the API server is published on; the kubeconfig's server
    /// URL is rewritten to this port.
    pub api_port: u16,
    /// In-container path where the kubeconfig appears.
    pub kubeconfig_path: String,
    /// Interval between liveness/kubeconfig poll attempts.
    pub wait_interval: Duration,
    /// Wall-clock ceiling for each of the two container polls.
    pub wait_budget: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Init,
    ImagePulled,
    Created,
    Started,
    Ready,
    Stopped,
}

/// A cluster container owned by the pipeline for the duration of one run.
pub struct ClusterContainer<R> {
    runtime: R,
    spec: ContainerSpec,
    settings: ClusterSettings,
    state: State,
    container_id: Option<String>,
}

impl<R: ContainerRuntime> ClusterContainer<R> {
    /// Validates the spec and wraps the runtime. No runtime call is made
    /// until [`ClusterContainer::start`].
    pub fn new(runtime: R, spec: ContainerSpec, settings: ClusterSettings) -> Result<Self> {
        spec.validate()?;
        Ok(ClusterContainer {
            runtime,
            spec,
            settings,
            state: State::Init,
            container_id: None,
        })
    }

    /// Pulls the image, creates and starts the container, then polls the
    /// runtime until it reports the container running.
    pub async fn start(&mut self, token: &CancellationToken) -> Result<()> {
        self.expect_state(State::Init, "start")?;

        info!(image = %self.spec.image, "pulling cluster image");
        self.runtime.pull_image(&self.spec.image).await?;
        self.state = State::ImagePulled;

        info!(name = %self.spec.name, "creating cluster container");
        let id = self.runtime.create_container(&self.spec).await?;
        self.container_id = Some(id.clone());
        self.state = State::Created;

        self.runtime.start_container(&id).await?;
        self.state = State::Started;

        info!(container = %id, "waiting for container to report running");
        let runtime = &self.runtime;
        wait::poll_until(
            self.settings.wait_interval,
            self.settings.wait_budget,
            "container to report running",
            token,
            || {
                let id = id.as_str();
                async move {
                    match runtime.is_running(id).await {
                        Ok(true) => Ok(Attempt::Ready(())),
                        Ok(false) => Ok(Attempt::NotYet),
                        Err(err) => Err(Error::Runtime(err)),
                    }
                }
            },
        )
        .await?;
        self.state = State::Ready;
        Ok(())
    }

    /// Extracts the credential bundle from the running container and
    /// rewrites its endpoint to the externally bound API port.
    ///
    /// While the path is missing the copy is retried; any other runtime
    /// failure is fatal. A bundle that arrives present but empty is a fatal
    /// configuration error rather than a timing issue, so it is never
    /// retried.
    pub async fn kubeconfig(&self, token: &CancellationToken) -> Result<Kubeconfig> {
        let raw = self.kubeconfig_bytes(token).await?;
        let text = String::from_utf8(raw)
            .map_err(|_| Error::Config("credential bundle is not valid UTF-8".to_string()))?;
        let mut kubeconfig = Kubeconfig::from_yaml(&text)?;
        rewrite_server_port(&mut kubeconfig, self.settings.api_port)?;
        Ok(kubeconfig)
    }

    async fn kubeconfig_bytes(&self, token: &CancellationToken) -> Result<Vec<u8>> {
        let id = self
            .container_id
            .as_deref()
            .ok_or_else(|| Error::Config("cluster container has not been created".to_string()))?;
        let runtime = &self.runtime;
        let path = self.settings.kubeconfig_path.as_str();
        let archive = wait::poll_until(
            self.settings.wait_interval,
            self.settings.wait_budget,
            "kubeconfig to appear in the container",
            token,
            || async move {
                match runtime.copy_from_container(id, path).await {
                    Ok(bytes) => Ok(Attempt::Ready(bytes)),
                    Err(err) if err.is_not_found() => {
                        debug!(container = %id, path = %path, "kubeconfig not present yet");
                        Ok(Attempt::NotYet)
                    }
                    Err(err) => Err(Error::Runtime(err)),
                }
            },
        )
        .await?;
        first_archive_entry(&archive)
    }

    /// Best-effort stop and remove. Safe to call from any state and more
    /// than once; later calls are no-ops. Both steps are attempted even if
    /// the first fails, and the first failure is returned.
    pub async fn stop(&mut self) -> Result<()> {
        let id = match self.container_id.take() {
            Some(id) => id,
            None => return Ok(()),
        };
        info!(container = %id, "stopping cluster container");
        let mut first_err = None;
        if let Err(err) = self.runtime.stop_container(&id).await {
            error!(container = %id, error = %err, "failed to stop container");
            first_err = Some(Error::Runtime(err));
        }
        if let Err(err) = self.runtime.remove_container(&id).await {
            error!(container = %id, error = %err, "failed to remove container");
            first_err.get_or_insert(Error::Runtime(err));
        }
        self.state = State::Stopped;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn expect_state(&self, expected: State, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "cannot {operation} the cluster container from state {:?}",
                self.state
            )))
        }
    }
}

/// Reads the first entry of the streamed archive. An archive with no first
/// entry, or a zero-length one, means the cluster wrote an empty file and
/// will not recover on its own.
fn first_archive_entry(archive: &[u8]) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(archive);
    let mut entries = archive.entries()?;
    let mut entry = match entries.next() {
        Some(entry) => entry?,
        None => return Err(Error::Config("credential bundle is empty".to_string())),
    };
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    if data.is_empty() {
        return Err(Error::Config("credential bundle is empty".to_string()));
    }
    Ok(data)
}

/// Rewrites the port of every cluster endpoint in the bundle, preserving
/// scheme and host. The in-container port and the host-exposed port may
/// differ, and only the latter is reachable from here.
fn rewrite_server_port(kubeconfig: &mut Kubeconfig, api_port: u16) -> Result<()> {
    for named in &mut kubeconfig.clusters {
        if let Some(cluster) = named.cluster.as_mut() {
            if let Some(server) = cluster.server.as_mut() {
                let mut url = Url::parse(server).map_err(|err| {
                    Error::Config(format!(
                        "invalid server url '{server}' in credential bundle: {err}"
                    ))
                })?;
                url.set_port(Some(api_port)).map_err(|()| {
                    Error::Config(format!("cannot set a port on server url '{server}'"))
                })?;
                *server = url.to_string();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::runtime::PortBinding;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const KUBECONFIG_YAML: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: default
  cluster:
    server: https://127.0.0.1:6443
contexts:
- name: default
  context:
    cluster: default
    user: default
current-context: default
users:
- name: default
  user:
    token: abc123
"#;

    #[derive(Default)]
    struct FakeRuntime {
        calls: Mutex<Vec<String>>,
        inspect_calls: AtomicUsize,
        running_after: usize,
        copy_results: Mutex<VecDeque<Result<Vec<u8>, RuntimeError>>>,
        fail_stop: bool,
    }

    impl FakeRuntime {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
            self.record("pull");
            Ok(())
        }

        async fn create_container(&self, _spec: &ContainerSpec) -> Result<String, RuntimeError> {
            self.record("create");
            Ok("cid-1".to_string())
        }

        async fn start_container(&self, _id: &str) -> Result<(), RuntimeError> {
            self.record("start");
            Ok(())
        }

        async fn is_running(&self, _id: &str) -> Result<bool, RuntimeError> {
            self.record("inspect");
            let n = self.inspect_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n > self.running_after)
        }

        async fn copy_from_container(&self, _id: &str, _path: &str) -> Result<Vec<u8>, RuntimeError> {
            self.record("copy");
            self.copy_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(RuntimeError::NotFound("no more results queued".into())))
        }

        async fn stop_container(&self, _id: &str) -> Result<(), RuntimeError> {
            self.record("stop");
            if self.fail_stop {
                Err(RuntimeError::NotFound("already gone".into()))
            } else {
                Ok(())
            }
        }

        async fn remove_container(&self, _id: &str) -> Result<(), RuntimeError> {
            self.record("rm");
            Ok(())
        }
    }

    fn settings() -> ClusterSettings {
        ClusterSettings {
            api_port: 7443,
            kubeconfig_path: "/etc/rancher/k3s/k3s.yaml".to_string(),
            wait_interval: Duration::from_millis(100),
            wait_budget: Duration::from_secs(30),
        }
    }

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "rancher/rancher:latest".into(),
            name: "crd-swagger-test".into(),
            privileged: true,
            restart_policy: Some("unless-stopped".into()),
            ports: vec![PortBinding {
                host_port: 7443,
                container_port: 6443,
            }],
        }
    }

    fn tarball(name: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
        builder.into_inner().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn start_walks_every_state_in_order() {
        let runtime = FakeRuntime {
            running_after: 3,
            ..Default::default()
        };
        let mut cluster = ClusterContainer::new(runtime, spec(), settings()).unwrap();
        cluster.start(&CancellationToken::new()).await.unwrap();
        assert_eq!(cluster.state, State::Ready);
        let calls = cluster.runtime.calls();
        assert_eq!(
            calls,
            vec!["pull", "create", "start", "inspect", "inspect", "inspect", "inspect"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_an_invalid_transition() {
        let mut cluster =
            ClusterContainer::new(FakeRuntime::default(), spec(), settings()).unwrap();
        let token = CancellationToken::new();
        cluster.start(&token).await.unwrap();
        let err = cluster.start(&token).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_poll_times_out_when_never_running() {
        let runtime = FakeRuntime {
            running_after: usize::MAX,
            ..Default::default()
        };
        let mut cluster = ClusterContainer::new(runtime, spec(), settings()).unwrap();
        let err = cluster.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
        assert_eq!(cluster.state, State::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn kubeconfig_retries_not_found_then_rewrites_port() {
        let runtime = FakeRuntime::default();
        runtime.copy_results.lock().unwrap().extend([
            Err(RuntimeError::NotFound("not there yet".into())),
            Ok(tarball("k3s.yaml", KUBECONFIG_YAML.as_bytes())),
        ]);
        let mut cluster = ClusterContainer::new(runtime, spec(), settings()).unwrap();
        let token = CancellationToken::new();
        cluster.start(&token).await.unwrap();
        let kubeconfig = cluster.kubeconfig(&token).await.unwrap();
        let server = kubeconfig.clusters[0]
            .cluster
            .as_ref()
            .unwrap()
            .server
            .as_ref()
            .unwrap();
        assert!(
            server.starts_with("https://127.0.0.1:7443"),
            "host preserved, port rewritten: {server}"
        );
        assert_eq!(
            cluster.runtime.calls().iter().filter(|c| *c == "copy").count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_credential_bundle_fails_without_retry() {
        let runtime = FakeRuntime::default();
        runtime.copy_results.lock().unwrap().extend([
            Ok(tarball("k3s.yaml", b"")),
            Ok(tarball("k3s.yaml", KUBECONFIG_YAML.as_bytes())),
        ]);
        let mut cluster = ClusterContainer::new(runtime, spec(), settings()).unwrap();
        let token = CancellationToken::new();
        cluster.start(&token).await.unwrap();
        let err = cluster.kubeconfig(&token).await.unwrap_err();
        match err {
            Error::Config(msg) => assert!(msg.contains("credential bundle is empty"), "{msg}"),
            other => panic!("expected config error, got {other:?}"),
        }
        // the empty bundle is fatal, not a timing issue: exactly one copy
        assert_eq!(
            cluster.runtime.calls().iter().filter(|c| *c == "copy").count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_during_copy_are_fatal() {
        let runtime = FakeRuntime::default();
        runtime
            .copy_results
            .lock()
            .unwrap()
            .push_back(Err(RuntimeError::BadOutput {
                command: "docker cp".into(),
                reason: "daemon hung up".into(),
            }));
        let mut cluster = ClusterContainer::new(runtime, spec(), settings()).unwrap();
        let token = CancellationToken::new();
        cluster.start(&token).await.unwrap();
        let err = cluster.kubeconfig(&token).await.unwrap_err();
        assert!(matches!(err, Error::Runtime(_)), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_attempts_remove_even_when_stop_fails() {
        let runtime = FakeRuntime {
            fail_stop: true,
            ..Default::default()
        };
        let mut cluster = ClusterContainer::new(runtime, spec(), settings()).unwrap();
        cluster.start(&CancellationToken::new()).await.unwrap();
        assert!(cluster.stop().await.is_err());
        let calls = cluster.runtime.calls();
        assert!(calls.contains(&"stop".to_string()));
        assert!(calls.contains(&"rm".to_string()));
        // second stop is a no-op
        let before = cluster.runtime.calls().len();
        assert!(cluster.stop().await.is_ok());
        assert_eq!(cluster.runtime.calls().len(), before);
    }

    #[tokio::test]
    async fn stop_before_create_is_a_no_op() {
        let mut cluster =
            ClusterContainer::new(FakeRuntime::default(), spec(), settings()).unwrap();
        assert!(cluster.stop().await.is_ok());
        assert!(cluster.runtime.calls().is_empty());
    }

    #[test]
    fn archive_with_no_entries_is_an_empty_bundle() {
        // a bare end-of-archive marker
        let empty = vec![0u8; 1024];
        let err = first_archive_entry(&empty).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }
}
