// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Secret-safe object bodies.
//!
//! `RedactedObject` is the only form in which an object body moves between the builder, the
//! state store, the diff engine and the cluster client. It can only be obtained by redaction, so
//! a `v1 Secret` inside it never carries real payload.

use crate::constants::secrets::{PLACEHOLDER, REDACTION_MARKER};
use crate::error::ApiError;
use crate::types::key::ObjectKey;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Clone, Debug)]
pub struct RedactedObject(DynamicObject);

impl RedactedObject {
    /// Replace every Secret payload value with the placeholder
    pub fn redact(mut object: DynamicObject) -> Self {
        if is_secret(&object) {
            redact_secret_payload(&mut object.data);
        }
        RedactedObject(object)
    }

    /// Transform the wrapped object, redacting the result again
    pub fn map(self, f: impl FnOnce(DynamicObject) -> DynamicObject) -> Self {
        RedactedObject::redact(f(self.0))
    }

    pub fn object(&self) -> &DynamicObject {
        &self.0
    }

    pub fn into_object(self) -> DynamicObject {
        self.0
    }

    pub fn is_secret(&self) -> bool {
        is_secret(&self.0)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.0).unwrap_or(Value::Null)
    }

    /// The body as shown to operators: Secret payload values become the redaction marker
    pub fn display_value(&self) -> Value {
        let mut value = self.to_value();
        if self.is_secret() {
            if let Some(Value::Object(data)) = value.get_mut("data") {
                for v in data.values_mut() {
                    *v = Value::String(REDACTION_MARKER.to_string());
                }
            }
        }
        value
    }

    /// Natural key of this object on `cluster`
    pub fn key(&self, cluster: &str) -> Result<ObjectKey, ApiError> {
        let types = self.0.types.as_ref().ok_or_else(|| {
            ApiError::InvalidObject(format!("object {} has no apiVersion/kind", self.0.name_any()))
        })?;
        let name = self
            .0
            .metadata
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                ApiError::InvalidObject(format!("{} object without a name", types.kind))
            })?;
        Ok(ObjectKey::new(
            cluster,
            types.api_version.as_str(),
            types.kind.as_str(),
            self.0.metadata.namespace.as_deref(),
            name,
        ))
    }
}

impl PartialEq for RedactedObject {
    fn eq(&self, other: &Self) -> bool {
        self.to_value() == other.to_value()
    }
}

impl Serialize for RedactedObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RedactedObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        DynamicObject::deserialize(deserializer).map(RedactedObject::redact)
    }
}

fn is_secret(object: &DynamicObject) -> bool {
    object
        .types
        .as_ref()
        .is_some_and(|t| t.api_version == "v1" && t.kind == "Secret")
}

fn redact_secret_payload(data: &mut Value) {
    let Some(fields) = data.as_object_mut() else {
        return;
    };

    let string_keys: Vec<String> = match fields.remove("stringData") {
        Some(Value::Object(string_data)) => string_data.keys().cloned().collect(),
        _ => Vec::new(),
    };

    let has_data = fields.get("data").is_some_and(|d| !d.is_null());
    if !has_data && string_keys.is_empty() {
        return;
    }

    let payload = fields
        .entry("data")
        .or_insert_with(|| Value::Object(Map::new()));
    if !payload.is_object() {
        *payload = Value::Object(Map::new());
    }
    if let Value::Object(payload) = payload {
        for key in string_keys {
            payload.insert(key, Value::Null);
        }
        for v in payload.values_mut() {
            *v = Value::String(PLACEHOLDER.to_string());
        }
    }
}
