// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Loading resource declarations from the monitored directory

use crate::constants::declarations::{GLOBAL_DIR, INDEX_FILE};
use crate::error::{ConvoyError, Result};
use crate::types::resource::{DeclaredResource, Resource};
use kube::api::DynamicObject;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

/// Load every resource declared in an `index.yaml` below `root`, in path order.
///
/// The namespace of a resource is the name of the directory holding its `index.yaml`; files
/// directly in `root` or in a `global` directory declare unnamespaced resources. Raw objects of
/// a namespaced resource must not name another namespace.
#[instrument]
pub fn load_resources(root: &Path) -> Result<Vec<DeclaredResource>> {
    let mut resources = Vec::new();
    let mut seen = BTreeSet::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| declaration_error(root, e))?;
        if !entry.file_type().is_file() || entry.file_name() != INDEX_FILE {
            continue;
        }

        let path = entry.path();
        let namespace = derive_namespace(root, path);
        for declared in load_file(path, namespace)? {
            check_object_namespaces(&declared)?;
            let id = declared.id();
            if !seen.insert(id.clone()) {
                return Err(declaration_error(path, format!("{} is declared twice", id)));
            }
            resources.push(declared);
        }
    }

    info!("Loaded {} resource declarations from {}", resources.len(), root.display());
    Ok(resources)
}

fn derive_namespace(root: &Path, index: &Path) -> Option<String> {
    let dir = index.parent()?;
    let relative = dir.strip_prefix(root).ok()?;
    relative
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| name != GLOBAL_DIR)
}

/// Objects of a namespaced `KubernetesYaml` resource may only repeat its own namespace
fn check_object_namespaces(declared: &DeclaredResource) -> Result<()> {
    let (Resource::KubernetesYaml(yaml), Some(namespace)) =
        (&declared.resource, declared.namespace.as_deref())
    else {
        return Ok(());
    };

    for object in &yaml.objects {
        let Some(foreign) = object
            .metadata
            .namespace
            .as_deref()
            .filter(|ns| *ns != namespace)
        else {
            continue;
        };
        let types = object
            .types
            .as_ref()
            .map(|t| format!("{}/{}", t.api_version, t.kind))
            .unwrap_or_else(|| "unknown".to_string());
        return Err(declaration_error(
            &declared.source,
            format!(
                "{} {} of {} should not specify namespace {}",
                types,
                object.metadata.name.as_deref().unwrap_or("<unnamed>"),
                declared.id(),
                foreign
            ),
        ));
    }
    Ok(())
}

fn load_file(path: &Path, namespace: Option<String>) -> Result<Vec<DeclaredResource>> {
    debug!("Reading {}", path.display());
    let dir = path.parent().unwrap_or(Path::new("."));
    let raw = fs::read_to_string(path).map_err(|e| declaration_error(path, e))?;

    let mut resources = Vec::new();
    for value in documents(&raw).map_err(|e| declaration_error(path, e))? {
        let mut resource =
            Resource::deserialize(value).map_err(|e| declaration_error(path, e))?;

        if let Resource::KubernetesYaml(yaml) = &mut resource {
            for source in std::mem::take(&mut yaml.sources) {
                let source_path = dir.join(&source);
                let raw = fs::read_to_string(&source_path)
                    .map_err(|e| declaration_error(&source_path, e))?;
                for value in documents(&raw).map_err(|e| declaration_error(&source_path, e))? {
                    let object = DynamicObject::deserialize(value)
                        .map_err(|e| declaration_error(&source_path, e))?;
                    yaml.objects.push(object);
                }
            }
        }

        let namespace = resource
            .metadata()
            .namespace
            .clone()
            .or_else(|| namespace.clone());
        resources.push(DeclaredResource {
            resource,
            namespace,
            source: PathBuf::from(path),
        });
    }
    Ok(resources)
}

/// Non-empty documents of a multi-document YAML stream
fn documents(raw: &str) -> std::result::Result<Vec<serde_yaml::Value>, serde_yaml::Error> {
    let mut values = Vec::new();
    for document in serde_yaml::Deserializer::from_str(raw) {
        let value = serde_yaml::Value::deserialize(document)?;
        if !value.is_null() {
            values.push(value);
        }
    }
    Ok(values)
}

fn declaration_error(path: &Path, reason: impl ToString) -> ConvoyError {
    ConvoyError::Declaration {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}
