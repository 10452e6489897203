//! End-to-end pipeline: boot a cluster container, wait for the requested
//! resources to be served, fetch the OpenAPI v2 document, filter it down,
//! and write it out. The container is torn down on every exit path.

use std::io::Write;

use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::ClusterContainer;
use crate::config::Config;
use crate::crds;
use crate::discovery;
use crate::error::Result;
use crate::resources::DesiredSet;
use crate::runtime::{docker::DockerCli, ContainerRuntime};
use crate::swagger::{filter, SwaggerDoc};

/// Runs the document generation pipeline described by a [`Config`].
pub struct Generator {
    config: Config,
}

impl Generator {
    /// Wraps a config in a runnable generator.
    pub fn new(config: Config) -> Self {
        Generator { config }
    }

    /// Runs the full pipeline once.
    ///
    /// Teardown always runs, even when an earlier step failed or the token
    /// was cancelled. The first error wins; a teardown failure is returned
    /// only when the pipeline itself succeeded.
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        let mut desired = DesiredSet::parse(&self.config.resources_source).await?;
        info!(resources = desired.len(), "parsed resource list");

        let runtime = DockerCli::new(self.config.request_timeout);
        let mut cluster = ClusterContainer::new(
            runtime,
            self.config.container_spec()?,
            self.config.cluster_settings(),
        )?;

        let outcome = self.generate(&mut cluster, &mut desired, token).await;
        let teardown = cluster.stop().await;
        outcome.and(teardown)
    }

    async fn generate<R: ContainerRuntime>(
        &self,
        cluster: &mut ClusterContainer<R>,
        desired: &mut DesiredSet,
        token: &CancellationToken,
    ) -> Result<()> {
        cluster.start(token).await?;
        let kubeconfig = cluster.kubeconfig(token).await?;
        let client = client_from(kubeconfig).await?;

        if let Some(source) = &self.config.crd_source {
            let defs = crds::load(source, self.config.recurse).await?;
            info!(count = defs.len(), "applying custom resource definitions");
            crds::apply(&client, defs).await?;
        }

        discovery::wait_for_resources(
            &client,
            desired,
            self.config.discovery_poll_interval,
            self.config.discovery_poll_budget,
            token,
        )
        .await?;

        info!("fetching OpenAPI document");
        let raw = fetch_openapi(&client).await?;
        let mut doc = SwaggerDoc::from_json(&raw)?;
        filter(&mut doc, desired, self.config.strict)?;
        self.write_document(&doc)
    }

    fn write_document(&self, doc: &SwaggerDoc) -> Result<()> {
        let mut data = doc.to_json(self.config.pretty_print)?;
        match &self.config.output_file {
            Some(path) => {
                info!(path = %path.display(), "writing document");
                let mut options = std::fs::OpenOptions::new();
                options.write(true).create(true).truncate(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o600);
                }
                let mut file = options.open(path)?;
                file.write_all(&data)?;
            }
            None => {
                data.push(b'\n');
                std::io::stdout().write_all(&data)?;
            }
        }
        Ok(())
    }
}

async fn client_from(kubeconfig: Kubeconfig) -> Result<kube::Client> {
    let options = KubeConfigOptions::default();
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
    Ok(kube::Client::try_from(config)?)
}

async fn fetch_openapi(client: &kube::Client) -> Result<String> {
    let request = http::Request::get("/openapi/v2").body(Vec::new())?;
    Ok(client.request_text(request).await?)
}
