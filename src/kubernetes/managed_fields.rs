// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Projection of live objects onto the fields one field manager owns.
//!
//! Live objects carry server defaults and fields written by other controllers. Refresh only
//! records what convoy itself applied, as described by the `fieldsV1` sets in
//! `metadata.managedFields`.

use crate::error::ApiError;
use kube::api::DynamicObject;
use serde_json::{Map, Value};

/// Metadata the API server populates; never part of a recorded body
const SERVER_METADATA: [&str; 8] = [
    "creationTimestamp",
    "deletionGracePeriodSeconds",
    "deletionTimestamp",
    "generation",
    "managedFields",
    "resourceVersion",
    "selfLink",
    "uid",
];

/// Reduce `object` to the fields owned by `manager`.
///
/// Identity (`apiVersion`, `kind`, name and namespace) is always kept. Objects without a
/// managed-fields entry for `manager` are only stripped of server metadata.
pub fn project_managed(object: &DynamicObject, manager: &str) -> Result<DynamicObject, ApiError> {
    let owned = object
        .metadata
        .managed_fields
        .iter()
        .flatten()
        .filter(|entry| entry.manager.as_deref() == Some(manager))
        .filter_map(|entry| entry.fields_v1.as_ref())
        .fold(None, |acc: Option<Value>, fields| {
            let mut merged = acc.unwrap_or_else(|| Value::Object(Map::new()));
            merge_fields(&mut merged, &fields.0);
            Some(merged)
        });

    let live = serde_json::to_value(object).map_err(invalid)?;
    let mut projected = match &owned {
        Some(fields) => project(&live, fields),
        None => live.clone(),
    };

    if let Value::Object(root) = &mut projected {
        for field in ["apiVersion", "kind"] {
            if let Some(value) = live.get(field) {
                root.insert(field.to_string(), value.clone());
            }
        }
        root.remove("status");

        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            for field in ["name", "namespace"] {
                if let Some(value) = live.pointer(&format!("/metadata/{}", field)) {
                    metadata.insert(field.to_string(), value.clone());
                }
            }
            for field in SERVER_METADATA {
                metadata.remove(field);
            }
        }
    }

    serde_json::from_value(projected).map_err(invalid)
}

/// Keep only the parts of `value` selected by a `fieldsV1` set
fn project(value: &Value, fields: &Value) -> Value {
    let Some(fields) = fields.as_object() else {
        return value.clone();
    };
    // `{}` or `{".": {}}` marks the whole value as owned
    if fields.keys().all(|k| k == ".") {
        return value.clone();
    }

    match value {
        Value::Object(map) => {
            let mut result = Map::new();
            for (selector, sub) in fields {
                let Some(name) = selector.strip_prefix("f:") else {
                    continue;
                };
                if let Some(child) = map.get(name) {
                    result.insert(name.to_string(), project(child, sub));
                }
            }
            Value::Object(result)
        }
        Value::Array(items) => {
            let selected = items
                .iter()
                .enumerate()
                .filter_map(|(index, item)| {
                    fields
                        .iter()
                        .find(|(selector, _)| selects(selector, index, item))
                        .map(|(_, sub)| project(item, sub))
                })
                .collect();
            Value::Array(selected)
        }
        other => other.clone(),
    }
}

/// Whether a list selector (`k:`, `v:` or `i:`) picks `item`
fn selects(selector: &str, index: usize, item: &Value) -> bool {
    if let Some(raw) = selector.strip_prefix("k:") {
        let Ok(Value::Object(wanted)) = serde_json::from_str::<Value>(raw) else {
            return false;
        };
        wanted.iter().all(|(k, v)| item.get(k) == Some(v))
    } else if let Some(raw) = selector.strip_prefix("v:") {
        serde_json::from_str::<Value>(raw).is_ok_and(|v| v == *item)
    } else if let Some(raw) = selector.strip_prefix("i:") {
        raw.parse::<usize>().is_ok_and(|i| i == index)
    } else {
        false
    }
}

fn merge_fields(into: &mut Value, from: &Value) {
    match (into, from) {
        (Value::Object(into), Value::Object(from)) => {
            for (key, value) in from {
                match into.get_mut(key) {
                    Some(existing) => merge_fields(existing, value),
                    None => {
                        into.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (into, from) => *into = from.clone(),
    }
}

fn invalid(err: serde_json::Error) -> ApiError {
    ApiError::InvalidObject(err.to_string())
}
