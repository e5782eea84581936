// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Desired-state building: declared resources to per-cluster Kubernetes objects.

mod deployment;

use crate::constants::{labels, MANAGER};
use crate::error::{ApiError, ConfigError, ConvoyError, Result};
use crate::evaluator::evaluate;
use crate::kubernetes::{with_timeout, ClusterClient, ClusterConnector};
use crate::redaction::RedactedObject;
use crate::registry::DigestResolver;
use crate::types::definition::ConfigDefinition;
use crate::types::key::ObjectKey;
use crate::types::resource::{
    DeclaredResource, DeploymentResource, KubernetesYamlResource, Resource,
};
use deployment::render_deployment;
use futures::future::join_all;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Objects a resource renders; `None` marks a key that must be absent
pub type Rendered = BTreeMap<ObjectKey, Option<RedactedObject>>;

#[derive(Clone, Debug, PartialEq)]
pub struct DesiredObject {
    /// Identity of the owning resource
    pub owner: String,
    /// `None` is an explicit absence marker
    pub object: Option<RedactedObject>,
}

#[derive(Debug, Default)]
pub struct DesiredState {
    pub objects: BTreeMap<ObjectKey, DesiredObject>,
    /// Resources that could not be built, by owner; their applied objects are left alone
    pub failures: BTreeMap<String, ConvoyError>,
}

impl DesiredState {
    pub fn is_failed(&self, owner: &str) -> bool {
        self.failures.contains_key(owner)
    }
}

/// Management labels and annotations stamped onto rendered objects
#[derive(Clone, Debug)]
pub struct Stamp {
    label_namespace: String,
    owner: String,
}

impl Stamp {
    pub fn new(label_namespace: &str, owner: &str) -> Self {
        Self {
            label_namespace: label_namespace.to_string(),
            owner: owner.to_string(),
        }
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}/{}", self.label_namespace, suffix)
    }

    pub fn apply(&self, metadata: &mut ObjectMeta) {
        metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(self.key(labels::MANAGED_BY), MANAGER.to_string());
        metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(self.key(labels::OWNER), self.owner.clone());
    }
}

pub struct DesiredStateBuilder {
    resolver: DigestResolver,
    /// Clusters are asked which raw object types are cluster-scoped
    connector: Arc<dyn ClusterConnector>,
    clients: Mutex<HashMap<String, Arc<dyn ClusterClient>>>,
    timeout: Duration,
    label_namespace: String,
}

impl DesiredStateBuilder {
    pub fn new(
        resolver: DigestResolver,
        connector: Arc<dyn ClusterConnector>,
        timeout: Duration,
        label_namespace: &str,
    ) -> Self {
        Self {
            resolver,
            connector,
            clients: Mutex::new(HashMap::new()),
            timeout,
            label_namespace: label_namespace.to_string(),
        }
    }

    /// Build all resources concurrently.
    ///
    /// A resource that fails is recorded in `failures` and contributes no objects. Two resources
    /// rendering the same key fail the whole build.
    #[instrument(skip(self, resources), fields(resources = resources.len()))]
    pub async fn build(&self, resources: &[DeclaredResource]) -> Result<DesiredState> {
        let rendered = join_all(resources.iter().map(|r| async move {
            (r.id().to_string(), self.render(r).await)
        }))
        .await;

        let mut state = DesiredState::default();
        for (owner, result) in rendered {
            let objects = match result {
                Ok(objects) => objects,
                Err(err) => {
                    warn!("Skipping {}: {}", owner, err);
                    state.failures.insert(owner, err);
                    continue;
                }
            };
            for (key, object) in objects {
                if let Some(existing) = state.objects.get(&key) {
                    return Err(ConvoyError::Conflict {
                        key,
                        first: existing.owner.clone(),
                        second: owner,
                    });
                }
                state.objects.insert(
                    key,
                    DesiredObject {
                        owner: owner.clone(),
                        object,
                    },
                );
            }
        }

        info!(
            "Built {} objects from {} resources ({} failed)",
            state.objects.len(),
            resources.len(),
            state.failures.len()
        );
        Ok(state)
    }

    /// Render one resource into its objects on every cluster it targets
    pub async fn render(&self, declared: &DeclaredResource) -> Result<Rendered> {
        let owner = declared.id().to_string();
        let stamp = Stamp::new(&self.label_namespace, &owner);
        match &declared.resource {
            Resource::Deployment(deployment) => {
                self.render_deployment(deployment, declared.namespace.as_deref(), &owner, &stamp)
                    .await
            }
            Resource::KubernetesYaml(yaml) => {
                let rendered =
                    render_kubernetes_yaml(yaml, declared.namespace.as_deref(), &owner, &stamp)?;
                self.scope(&owner, rendered).await
            }
        }
    }

    /// Drop the namespace from objects whose type is cluster-scoped on their cluster.
    ///
    /// Types a cluster does not serve (yet) keep the namespace they were rendered with.
    async fn scope(&self, owner: &str, rendered: Rendered) -> Result<Rendered> {
        let mut scoped = Rendered::new();
        for (key, object) in rendered {
            let cluster_scoped = key.namespace.is_some()
                && !self
                    .is_namespaced(&key)
                    .await
                    .map_err(|source| ConvoyError::Api {
                        key: key.clone(),
                        source,
                    })?;
            let (key, object) = if cluster_scoped {
                debug!("{} is cluster-scoped, dropping its namespace", key);
                let object = object.map(|o| {
                    o.map(|mut o| {
                        o.metadata.namespace = None;
                        o
                    })
                });
                let key = ObjectKey {
                    namespace: None,
                    ..key
                };
                (key, object)
            } else {
                (key, object)
            };

            if scoped.contains_key(&key) {
                return Err(render_error(owner, format!("{} is declared twice", key)));
            }
            scoped.insert(key, object);
        }
        Ok(scoped)
    }

    async fn is_namespaced(&self, key: &ObjectKey) -> std::result::Result<bool, ApiError> {
        let client = self.client(&key.cluster).await?;
        let namespaced = with_timeout(
            self.timeout,
            &key.cluster,
            client.is_namespaced(&key.api_version, &key.kind),
        )
        .await;
        match namespaced {
            Err(ApiError::UnknownType { .. }) => Ok(true),
            other => other,
        }
    }

    async fn client(
        &self,
        cluster: &str,
    ) -> std::result::Result<Arc<dyn ClusterClient>, ApiError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(cluster) {
            return Ok(client.clone());
        }
        let client = with_timeout(self.timeout, cluster, self.connector.connect(cluster)).await?;
        clients.insert(cluster.to_string(), client.clone());
        Ok(client)
    }

    async fn render_deployment(
        &self,
        resource: &DeploymentResource,
        namespace: Option<&str>,
        owner: &str,
        stamp: &Stamp,
    ) -> Result<Rendered> {
        let namespace = namespace.ok_or_else(|| ConvoyError::Render {
            resource: owner.to_string(),
            reason: "a Deployment needs a namespace".to_string(),
        })?;
        let config_error = |source: ConfigError| ConvoyError::Config {
            resource: owner.to_string(),
            source,
        };

        let image = self
            .resolver
            .resolve_config_image(&resource.config.image)
            .await
            .map_err(|source| ConvoyError::Registry {
                resource: owner.to_string(),
                source,
            })?;
        let definition = ConfigDefinition::from_yaml(&image.definition).map_err(config_error)?;
        let descriptor = evaluate(&definition, &resource.config.env, &resource.config.variables)
            .map_err(config_error)?;
        let template = render_deployment(
            &resource.metadata,
            namespace,
            &image,
            &descriptor,
            resource.config.service.as_ref(),
            stamp,
        )
        .map_err(config_error)?;

        let mut rendered = Rendered::new();
        for (cluster, entry) in &resource.footprint {
            let deployment = to_object(owner, &template.with_replicas(entry.replicas))?;
            let service = template
                .service
                .as_ref()
                .map(|s| to_object(owner, s))
                .transpose()?;

            for object in std::iter::once(deployment).chain(service) {
                let key = object.key(cluster).map_err(|e| render_error(owner, e))?;
                // Zero replicas keep the keys but mark them absent
                let object = (entry.replicas > 0).then_some(object);
                rendered.insert(key, object);
            }
        }

        debug!("{} renders {} keys", owner, rendered.len());
        Ok(rendered)
    }
}

fn render_kubernetes_yaml(
    resource: &KubernetesYamlResource,
    namespace: Option<&str>,
    owner: &str,
    stamp: &Stamp,
) -> Result<Rendered> {
    let mut rendered = Rendered::new();
    for object in &resource.objects {
        if object.types.is_none() {
            return Err(render_error(
                owner,
                format!(
                    "object {} has no apiVersion/kind",
                    object.metadata.name.as_deref().unwrap_or("<unnamed>")
                ),
            ));
        }

        let mut object: DynamicObject = object.clone();
        if object.metadata.namespace.is_none() {
            object.metadata.namespace = namespace.map(str::to_string);
        }
        stamp.apply(&mut object.metadata);
        let object = RedactedObject::redact(object);

        for cluster in &resource.clusters {
            let key = object.key(cluster).map_err(|e| render_error(owner, e))?;
            if rendered.insert(key.clone(), Some(object.clone())).is_some() {
                return Err(render_error(owner, format!("{} is declared twice", key)));
            }
        }
    }
    Ok(rendered)
}

fn to_object<K: Serialize>(owner: &str, typed: &K) -> Result<RedactedObject> {
    serde_json::to_value(typed)
        .and_then(serde_json::from_value::<DynamicObject>)
        .map(RedactedObject::redact)
        .map_err(|e| render_error(owner, e))
}

fn render_error(owner: &str, reason: impl ToString) -> ConvoyError {
    ConvoyError::Render {
        resource: owner.to_string(),
        reason: reason.to_string(),
    }
}
