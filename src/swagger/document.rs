//! Typed shell around the cluster's Swagger document.
//!
//! Only the parts the filter needs are modeled as structs: the path map,
//! the seven operation slots per path, and the operation pieces that hold
//! references (parameters, responses) or the group-version-kind vendor
//! extension. Everything else rides along untouched in flattened maps so
//! the output document is byte-faithful to the input apart from the
//! pruning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::resources::GroupKind;

/// The vendor extension k8s stamps on operations with the originating
/// resource's kind and group.
pub const GVK_EXTENSION: &str = "x-kubernetes-group-version-kind";

/// A Swagger v2 document as served by `/openapi/v2`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SwaggerDoc {
    /// Format version, `"2.0"` in practice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swagger: Option<String>,
    /// The info block, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    /// Path-string to operation set.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub paths: BTreeMap<String, PathItem>,
    /// Named schema definitions, referenced via `#/definitions/<name>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub definitions: BTreeMap<String, Value>,
    /// Shared parameters, referenced via `#/parameters/<name>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    /// Every other top-level field (securityDefinitions and friends).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SwaggerDoc {
    /// Decodes a document from the raw JSON the cluster served.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Serializes the document, 2-space indented when `pretty`.
    pub fn to_json(&self, pretty: bool) -> Result<Vec<u8>> {
        let data = if pretty {
            serde_json::to_vec_pretty(self)?
        } else {
            serde_json::to_vec(self)?
        };
        Ok(data)
    }
}

/// One path entry with its seven HTTP-method slots.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PathItem {
    /// GET operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<Operation>,
    /// PUT operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<Operation>,
    /// POST operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<Operation>,
    /// DELETE operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<Operation>,
    /// OPTIONS operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Operation>,
    /// HEAD operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<Operation>,
    /// PATCH operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Operation>,
    /// Parameters shared by every operation on the path.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Value>,
    /// Any remaining path-item fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PathItem {
    /// The operations present on this path, with their method names.
    pub fn operations(&self) -> impl Iterator<Item = (&'static str, &Operation)> {
        [
            ("get", self.get.as_ref()),
            ("put", self.put.as_ref()),
            ("post", self.post.as_ref()),
            ("delete", self.delete.as_ref()),
            ("options", self.options.as_ref()),
            ("head", self.head.as_ref()),
            ("patch", self.patch.as_ref()),
        ]
        .into_iter()
        .filter_map(|(method, op)| op.map(|op| (method, op)))
    }

    /// The distinct resource keys stamped on this path's operations.
    ///
    /// Operations without a decodable extension contribute nothing; that is
    /// logged and the remaining operations still count.
    pub fn group_kinds(&self, path: &str) -> Vec<GroupKind> {
        let mut keys = std::collections::BTreeSet::new();
        for (method, op) in self.operations() {
            match op.group_kind() {
                Some(gk) => {
                    keys.insert(gk);
                }
                None => debug!(
                    path = %path,
                    method = %method,
                    "operation carries no usable group-version-kind extension"
                ),
            }
        }
        keys.into_iter().collect()
    }
}

/// One operation; only reference-bearing fields are typed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Operation {
    /// Operation parameters; may hold inline schemas or `$ref`s.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Value>,
    /// Response map; response schemas reference definitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses: Option<Value>,
    /// Everything else, including the vendor extensions.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl Operation {
    /// Decodes this operation's group-version-kind extension, if present
    /// and well formed.
    pub fn group_kind(&self) -> Option<GroupKind> {
        let raw = self.extensions.get(GVK_EXTENSION)?;
        serde_json::from_value(raw.clone()).ok()
    }
}
