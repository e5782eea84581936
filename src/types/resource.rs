// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::types::variable::Bindings;
use kube::api::DynamicObject;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// A resource declared in an `index.yaml` document
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind")]
pub enum Resource {
    Deployment(DeploymentResource),
    KubernetesYaml(KubernetesYamlResource),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Deployment(_) => "Deployment",
            Resource::KubernetesYaml(_) => "KubernetesYaml",
        }
    }

    pub fn metadata(&self) -> &ResourceMetadata {
        match self {
            Resource::Deployment(d) => &d.metadata,
            Resource::KubernetesYaml(k) => &k.metadata,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Overrides the namespace derived from the declaration's directory
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DeploymentResource {
    pub api_version: String,
    pub metadata: ResourceMetadata,
    pub config: DeploymentConfig,
    #[serde(default)]
    pub footprint: Footprint,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Config image reference, usually a floating tag
    pub image: String,
    /// Environment name selecting configuration branches
    pub env: String,
    #[serde(default)]
    pub variables: Bindings,
    pub service: Option<ServiceConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Declared port name to the port exposed by the Service
    #[serde(default)]
    pub ports: BTreeMap<String, ServicePortMapping>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicePortMapping {
    pub number: i32,
    pub name: Option<String>,
}

/// Cluster name to deployment sizing; clusters not listed get nothing
pub type Footprint = BTreeMap<String, FootprintEntry>;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FootprintEntry {
    pub replicas: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct KubernetesYamlResource {
    pub api_version: String,
    pub metadata: ResourceMetadata,
    pub clusters: Vec<String>,
    #[serde(default)]
    pub objects: Vec<DynamicObject>,
    /// Multi-document YAML files, relative to the declaring `index.yaml`
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Identity of a declared resource; recorded as the owner of every object it renders
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResourceId {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{} {}/{}", self.kind, namespace, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A resource together with where it was declared
#[derive(Clone, Debug)]
pub struct DeclaredResource {
    pub resource: Resource,
    /// Namespace derived from the declaring directory, or the explicit override
    pub namespace: Option<String>,
    pub source: std::path::PathBuf,
}

impl DeclaredResource {
    pub fn id(&self) -> ResourceId {
        ResourceId {
            kind: self.resource.kind().to_string(),
            namespace: self.namespace.clone(),
            name: self.resource.metadata().name.clone(),
        }
    }
}
