//! Configuration for a generation run.
//!
//! Build a [`Config`] manually or with [`Config::new_from_flags`] from the
//! command line. The timeout knobs are not exposed as flags; the defaults
//! match how long a cold Rancher bring-up is allowed to take.

use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;
use uuid::Uuid;

use crate::cluster::ClusterSettings;
use crate::error::Result;
use crate::runtime::{ContainerSpec, PortBinding};

/// Image used when the caller does not name one.
pub const DEFAULT_IMAGE: &str = "rancher/rancher:latest";

const CONTAINER_HTTP_PORT: u16 = 80;
const CONTAINER_HTTPS_PORT: u16 = 443;
const CONTAINER_API_PORT: u16 = 6443;

/// Where k3s writes its kubeconfig inside the Rancher container.
const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const WAIT_INTERVAL: Duration = Duration::from_millis(500);
const WAIT_BUDGET: Duration = Duration::from_secs(10 * 60);
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DISCOVERY_POLL_BUDGET: Duration = Duration::from_secs(5 * 60);

/// Everything a [`Generator`](crate::Generator) needs for one run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path or URL of the `Kind[.Group]` resource list.
    pub resources_source: String,
    /// Output file; stdout when unset.
    pub output_file: Option<PathBuf>,
    /// Indent the output JSON.
    pub pretty_print: bool,
    /// Full image reference of the cluster container.
    pub image: String,
    /// Host port published for container HTTP traffic.
    pub http_port: u16,
    /// Host port published for container HTTPS traffic.
    pub https_port: u16,
    /// Host port published for the embedded API server.
    pub api_port: u16,
    /// Optional source of CRD manifests to seed before discovery.
    pub crd_source: Option<String>,
    /// Recurse into directories when loading CRD manifests.
    pub recurse: bool,
    /// Fail when a requested resource matches no schema path.
    pub strict: bool,
    /// Only log warnings and errors.
    pub quiet: bool,
    /// Ceiling for each individual container runtime call.
    pub request_timeout: Duration,
    /// Interval of the container liveness and kubeconfig polls.
    pub wait_interval: Duration,
    /// Wall-clock budget of the container liveness and kubeconfig polls.
    pub wait_budget: Duration,
    /// Interval of the discovery poll.
    pub discovery_poll_interval: Duration,
    /// Wall-clock budget of the discovery poll.
    pub discovery_poll_budget: Duration,
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "crd-swagger",
    about = "Generates a Swagger (OpenAPI v2) document describing a chosen set of Kubernetes resources, served from a disposable cluster container"
)]
struct Opts {
    /// Path or URL of a file with Kind.Group resources (e.g.
    /// RoleTemplate.management.cattle.io), one per line
    #[structopt(short = "f", long = "resources-file")]
    resources_file: String,

    /// Output file for the generated document (default: stdout)
    #[structopt(short = "o", long = "output-file")]
    output_file: Option<PathBuf>,

    /// Pretty-print the output JSON with indentation
    #[structopt(short = "j", long = "pretty-print")]
    pretty_print: bool,

    /// Image to boot the disposable cluster from
    #[structopt(short = "i", long = "image", default_value = "rancher/rancher:latest")]
    image: String,

    /// Host port for HTTP traffic (e.g. 80, 8080)
    #[structopt(short = "p", long = "http-port", default_value = "80")]
    http_port: u16,

    /// Host port for HTTPS traffic (e.g. 443, 8443)
    #[structopt(short = "t", long = "https-port", default_value = "443")]
    https_port: u16,

    /// Host port the embedded API server is published on
    #[structopt(long = "api-port", default_value = "6443")]
    api_port: u16,

    /// Path, directory, or URL of CRD manifests to create before discovery
    #[structopt(short = "c", long = "crd-source")]
    crd_source: Option<String>,

    /// Recurse into sub-directories of --crd-source
    #[structopt(short = "r", long = "recurse")]
    recurse: bool,

    /// Keep going when a requested resource matches no schema path
    #[structopt(long = "allow-missing")]
    allow_missing: bool,

    /// Only log warnings and errors
    #[structopt(short = "q", long = "quiet")]
    quiet: bool,
}

impl Config {
    /// A config with default ports, image, and timeouts.
    pub fn new(resources_source: impl Into<String>) -> Self {
        Config {
            resources_source: resources_source.into(),
            output_file: None,
            pretty_print: false,
            image: DEFAULT_IMAGE.to_string(),
            http_port: CONTAINER_HTTP_PORT,
            https_port: CONTAINER_HTTPS_PORT,
            api_port: CONTAINER_API_PORT,
            crd_source: None,
            recurse: false,
            strict: true,
            quiet: false,
            request_timeout: REQUEST_TIMEOUT,
            wait_interval: WAIT_INTERVAL,
            wait_budget: WAIT_BUDGET,
            discovery_poll_interval: DISCOVERY_POLL_INTERVAL,
            discovery_poll_budget: DISCOVERY_POLL_BUDGET,
        }
    }

    /// Parses the command line into a config.
    pub fn new_from_flags() -> Self {
        Self::from_opts(Opts::from_args())
    }

    fn from_opts(opts: Opts) -> Self {
        let mut config = Config::new(opts.resources_file);
        config.output_file = opts.output_file;
        config.pretty_print = opts.pretty_print;
        config.image = opts.image;
        config.http_port = opts.http_port;
        config.https_port = opts.https_port;
        config.api_port = opts.api_port;
        config.crd_source = opts.crd_source;
        config.recurse = opts.recurse;
        config.strict = !opts.allow_missing;
        config.quiet = opts.quiet;
        config
    }

    /// The container declaration for this run, with a unique name.
    ///
    /// Port conflicts are rejected here, before any runtime call.
    pub fn container_spec(&self) -> Result<ContainerSpec> {
        let spec = ContainerSpec {
            image: self.image.clone(),
            name: format!("crd-swagger-{}", Uuid::new_v4()),
            privileged: true,
            restart_policy: Some("unless-stopped".to_string()),
            ports: vec![
                PortBinding {
                    host_port: self.http_port,
                    container_port: CONTAINER_HTTP_PORT,
                },
                PortBinding {
                    host_port: self.https_port,
                    container_port: CONTAINER_HTTPS_PORT,
                },
                PortBinding {
                    host_port: self.api_port,
                    container_port: CONTAINER_API_PORT,
                },
            ],
        };
        spec.validate()?;
        Ok(spec)
    }

    /// The poll and rewrite settings for the cluster container.
    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            api_port: self.api_port,
            kubeconfig_path: KUBECONFIG_PATH.to_string(),
            wait_interval: self.wait_interval,
            wait_budget: self.wait_budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn container_spec_maps_all_three_ports() {
        let mut config = Config::new("resources.txt");
        config.http_port = 8080;
        config.https_port = 8443;
        config.api_port = 7443;
        let spec = config.container_spec().unwrap();
        assert!(spec.privileged);
        assert_eq!(spec.ports.len(), 3);
        assert!(spec
            .ports
            .iter()
            .any(|p| p.host_port == 7443 && p.container_port == 6443));
        assert!(spec.name.starts_with("crd-swagger-"));
    }

    #[test]
    fn conflicting_host_ports_are_rejected() {
        let mut config = Config::new("resources.txt");
        config.http_port = 8080;
        config.https_port = 8080;
        let err = config.container_spec().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn container_names_are_unique_per_spec() {
        let config = Config::new("resources.txt");
        let a = config.container_spec().unwrap();
        let b = config.container_spec().unwrap();
        assert_ne!(a.name, b.name);
    }
}
