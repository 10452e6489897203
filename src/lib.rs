//! Generates a Swagger (OpenAPI v2) document describing a chosen set of
//! Kubernetes resources.
//!
//! A disposable cluster container (Rancher by default) is booted through a
//! container runtime, its kubeconfig is extracted and rewritten to point at
//! the published API port, discovery is polled until every requested
//! resource is served, and the cluster's `/openapi/v2` document is filtered
//! down to the requested resources and their transitively referenced
//! definitions.

#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod crds;
pub mod discovery;
pub mod error;
pub mod generator;
pub mod resources;
pub mod runtime;
pub mod swagger;
pub mod wait;

pub use error::Error;
pub use generator::Generator;
