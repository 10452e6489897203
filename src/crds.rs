//! Loading and applying CustomResourceDefinition manifests.
//!
//! When the desired resources are CRD-backed rather than built-ins, the
//! definitions have to be seeded into the fresh cluster before the
//! discovery gate can ever see them. Manifests can come from a YAML file,
//! a directory of files (optionally recursed into), or a URL. Non-CRD
//! documents in the same stream are skipped so full deployment manifests
//! can be pointed at directly.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

const CRD_KIND: &str = "CustomResourceDefinition";

/// Reads every CRD reachable from `source` (local path or URL).
///
/// Duplicate CRD names across the input are a configuration error.
pub async fn load(source: &str, recurse: bool) -> Result<Vec<CustomResourceDefinition>> {
    let mut found = BTreeMap::new();
    if source.starts_with("http://") || source.starts_with("https://") {
        info!(url = %source, "fetching CRD manifests");
        let response = reqwest::get(source)
            .await
            .map_err(|err| Error::Config(format!("failed to fetch '{source}': {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Config(format!(
                "failed to fetch '{source}': status {status}"
            )));
        }
        let text = response
            .text()
            .await
            .map_err(|err| Error::Config(format!("failed to read body of '{source}': {err}")))?;
        parse_documents(&text, source, &mut found)?;
    } else {
        let path = Path::new(source);
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|err| Error::Config(format!("failed to stat '{source}': {err}")))?;
        if meta.is_dir() {
            load_dir(path, recurse, &mut found).await?;
        } else {
            load_file(path, &mut found).await?;
        }
    }
    Ok(found.into_values().collect())
}

/// Creates each CRD in the cluster. An already-existing definition is fine;
/// the discovery gate downstream is what establishes that the kinds are
/// actually served.
pub async fn apply(client: &kube::Client, crds: Vec<CustomResourceDefinition>) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    for crd in crds {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match api.create(&PostParams::default(), &crd).await {
            Ok(_) => info!(crd = %name, "created CustomResourceDefinition"),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(crd = %name, "CustomResourceDefinition already exists")
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

async fn load_dir(
    dir: &Path,
    recurse: bool,
    found: &mut BTreeMap<String, CustomResourceDefinition>,
) -> Result<()> {
    // iterative walk; manifest trees are shallow and this keeps the future Send
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|err| Error::Config(format!("failed to read dir '{}': {err}", dir.display())))?;
        let mut files: Vec<PathBuf> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                if recurse {
                    pending.push(path);
                }
            } else {
                files.push(path);
            }
        }
        // directory order is unspecified; sort so duplicate detection is stable
        files.sort();
        for file in files {
            load_file(&file, found).await?;
        }
    }
    Ok(())
}

async fn load_file(path: &Path, found: &mut BTreeMap<String, CustomResourceDefinition>) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| Error::Config(format!("failed to open '{}': {err}", path.display())))?;
    parse_documents(&text, &path.display().to_string(), found)
}

fn parse_documents(
    text: &str,
    source: &str,
    found: &mut BTreeMap<String, CustomResourceDefinition>,
) -> Result<()> {
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|err| Error::Config(format!("invalid YAML in '{source}': {err}")))?;
        if value.is_null() {
            continue;
        }
        let kind = value.get("kind").and_then(|kind| kind.as_str());
        if kind != Some(CRD_KIND) {
            debug!(source = %source, kind = ?kind, "skipping non-CRD document");
            continue;
        }
        let crd: CustomResourceDefinition = serde_yaml::from_value(value)
            .map_err(|err| Error::Config(format!("invalid CRD in '{source}': {err}")))?;
        let name = crd.metadata.name.clone().unwrap_or_default();
        if found.insert(name.clone(), crd).is_some() {
            return Err(Error::Config(format!(
                "duplicate CustomResourceDefinition '{name}'"
            )));
        }
        debug!(crd = %name, source = %source, "loaded CustomResourceDefinition");
    }
    Ok(())
}
