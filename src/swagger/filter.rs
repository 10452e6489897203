//! Pruning the document to the reference-closed subset of matched paths.
//!
//! Two phases. Path matching keeps a path when any of its operations'
//! extracted resource keys is in the desired set. Closure pruning then
//! walks every surviving operation's parameters and responses, chasing
//! `$ref` links through shared parameters and schema definitions with a
//! visited set as the cycle guard, and drops whatever was never reached.
//! Kubernetes schemas are self-referential, so the walk must tolerate
//! cycles.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::resources::DesiredSet;
use crate::swagger::document::SwaggerDoc;

/// Filters `doc` down to the operations matching `desired` and the
/// definitions/parameters they reach.
///
/// `desired`'s found flags are reset and re-marked here: the discovery gate
/// confirmed the kinds are served, this phase confirms they appear in the
/// schema, and the two can disagree. With `strict` set, any key that never
/// matched a path is an error naming the stragglers; an empty kept set is
/// always an error.
pub fn filter(doc: &mut SwaggerDoc, desired: &mut DesiredSet, strict: bool) -> Result<()> {
    if doc.paths.is_empty() {
        return Err(Error::Match("document has no paths".to_string()));
    }
    desired.reset_found();

    let mut keep: BTreeSet<String> = BTreeSet::new();
    for (name, item) in &doc.paths {
        let mut matched = false;
        for key in item.group_kinds(name) {
            if desired.contains(&key) {
                desired.mark_found(&key);
                matched = true;
            }
        }
        if matched {
            debug!(path = %name, "keeping path");
            keep.insert(name.clone());
        }
    }

    if keep.is_empty() {
        return Err(Error::Match(format!(
            "no paths matched the requested resources: {}",
            desired.missing_display()
        )));
    }
    if strict && !desired.all_found() {
        return Err(Error::Match(format!(
            "no path matched resource(s): {}",
            desired.missing_display()
        )));
    }

    let dropped = doc.paths.len() - keep.len();
    doc.paths.retain(|name, _| keep.contains(name));
    prune_unreached(doc);
    info!(
        kept = keep.len(),
        dropped, "filtered document paths"
    );
    Ok(())
}

#[derive(Default)]
struct Visited {
    definitions: BTreeSet<String>,
    parameters: BTreeSet<String>,
}

/// Drops every definition and shared parameter not transitively reachable
/// from the kept operations.
fn prune_unreached(doc: &mut SwaggerDoc) {
    let mut visited = Visited::default();
    {
        let definitions = &doc.definitions;
        let parameters = &doc.parameters;
        for item in doc.paths.values() {
            for parameter in &item.parameters {
                walk(parameter, definitions, parameters, &mut visited);
            }
            for (_, op) in item.operations() {
                for parameter in &op.parameters {
                    walk(parameter, definitions, parameters, &mut visited);
                }
                if let Some(responses) = &op.responses {
                    walk(responses, definitions, parameters, &mut visited);
                }
            }
        }
    }
    doc.definitions
        .retain(|name, _| visited.definitions.contains(name));
    doc.parameters
        .retain(|name, _| visited.parameters.contains(name));
}

/// Recursively collects `$ref` targets from a JSON value. Nested
/// properties, items, and allOf-style composition are all plain object or
/// array structure, so walking the whole value covers them.
fn walk(
    value: &Value,
    definitions: &BTreeMap<String, Value>,
    parameters: &BTreeMap<String, Value>,
    visited: &mut Visited,
) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get("$ref") {
                follow(target, definitions, parameters, visited);
            }
            for nested in map.values() {
                walk(nested, definitions, parameters, visited);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, definitions, parameters, visited);
            }
        }
        _ => {}
    }
}

/// Resolves one reference and recurses into its target. The visited set is
/// updated before the recursion; that is the cycle guard.
fn follow(
    target: &str,
    definitions: &BTreeMap<String, Value>,
    parameters: &BTreeMap<String, Value>,
    visited: &mut Visited,
) {
    if let Some(name) = target.strip_prefix("#/parameters/") {
        if visited.parameters.insert(name.to_string()) {
            match parameters.get(name) {
                Some(parameter) => walk(parameter, definitions, parameters, visited),
                None => warn!(reference = %target, "dangling parameter reference"),
            }
        }
    } else if let Some(name) = target.strip_prefix("#/definitions/") {
        if visited.definitions.insert(name.to_string()) {
            match definitions.get(name) {
                Some(schema) => walk(schema, definitions, parameters, visited),
                None => warn!(reference = %target, "dangling definition reference"),
            }
        }
    } else {
        debug!(reference = %target, "leaving unrecognized reference untouched");
    }
}
