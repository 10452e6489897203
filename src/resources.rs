//! The set of resource kinds the caller wants in the output document.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Identifies a Kubernetes resource type irrespective of version.
///
/// Equality is structural on `(kind, group)`. Doubles as the decode target
/// for the `x-kubernetes-group-version-kind` vendor extension, whose extra
/// `version` field is ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKind {
    /// API group; empty for the core group.
    #[serde(default)]
    pub group: String,
    /// Resource kind, e.g. `Deployment`.
    pub kind: String,
}

impl GroupKind {
    /// Parses a `Kind[.Group]` identifier. The first dot splits kind from
    /// group, so the group may itself contain dots.
    pub fn parse(entry: &str) -> Self {
        match entry.split_once('.') {
            Some((kind, group)) => GroupKind {
                kind: kind.to_string(),
                group: group.to_string(),
            },
            None => GroupKind {
                kind: entry.to_string(),
                group: String::new(),
            },
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// The resource kinds the caller asked for, each with a "confirmed present"
/// flag. Created once from user input and never shrinks; the discovery gate
/// and the schema filter flip the flags as kinds are confirmed.
#[derive(Clone, Debug, Default)]
pub struct DesiredSet {
    entries: BTreeMap<GroupKind, bool>,
}

impl DesiredSet {
    /// Builds a set from a newline-delimited `Kind[.Group]` source, read
    /// from a local path or fetched from an `http(s)://` URL.
    ///
    /// Lines are trimmed; blank lines and `#` comments are skipped;
    /// duplicates collapse. An empty result is a configuration error.
    pub async fn parse(source: &str) -> Result<Self> {
        let text = read_source(source).await?;
        let set = Self::from_lines(&text)?;
        if set.is_empty() {
            return Err(Error::Config(format!(
                "no resource identifiers found in '{source}'"
            )));
        }
        Ok(set)
    }

    fn from_lines(text: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let gk = GroupKind::parse(line);
            debug!(resource = %gk, "parsed resource identifier");
            entries.insert(gk, false);
        }
        Ok(DesiredSet { entries })
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the key was requested by the caller.
    pub fn contains(&self, key: &GroupKind) -> bool {
        self.entries.contains_key(key)
    }

    /// Flips the found flag for `key` if it was requested. Returns true on
    /// the first confirmation, false when the key is unknown or already
    /// confirmed. Unknown keys are a no-op: clusters serve far more kinds
    /// than the caller asked for.
    pub fn mark_found(&mut self, key: &GroupKind) -> bool {
        match self.entries.get_mut(key) {
            Some(found @ false) => {
                *found = true;
                true
            }
            _ => false,
        }
    }

    /// Clears every found flag, so a later stage can re-confirm presence
    /// against a different source of truth.
    pub fn reset_found(&mut self) {
        for found in self.entries.values_mut() {
            *found = false;
        }
    }

    /// Whether every requested key has been confirmed.
    pub fn all_found(&self) -> bool {
        self.entries.values().all(|found| *found)
    }

    /// Iterates over every requested key.
    pub fn keys(&self) -> impl Iterator<Item = &GroupKind> {
        self.entries.keys()
    }

    /// The keys not yet confirmed, formatted for an error message.
    pub fn missing_display(&self) -> String {
        let missing: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, found)| !**found)
            .map(|(gk, _)| gk.to_string())
            .collect();
        if missing.is_empty() {
            "none".to_string()
        } else {
            missing.join(", ")
        }
    }
}

impl FromIterator<GroupKind> for DesiredSet {
    fn from_iter<I: IntoIterator<Item = GroupKind>>(iter: I) -> Self {
        DesiredSet {
            entries: iter.into_iter().map(|gk| (gk, false)).collect(),
        }
    }
}

async fn read_source(source: &str) -> Result<String> {
    if source.starts_with("http://") || source.starts_with("https://") {
        info!(url = %source, "fetching resource list");
        let response = reqwest::get(source)
            .await
            .map_err(|err| Error::Config(format!("failed to fetch '{source}': {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Config(format!(
                "failed to fetch '{source}': status {status}"
            )));
        }
        response
            .text()
            .await
            .map_err(|err| Error::Config(format!("failed to read body of '{source}': {err}")))
    } else {
        info!(path = %source, "reading resource list");
        tokio::fs::read_to_string(source)
            .await
            .map_err(|err| Error::Config(format!("failed to open '{source}': {err}")))
    }
}
