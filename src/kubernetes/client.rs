// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Per-cluster API access for dynamically typed objects

use super::ensure_namespace_exists;
use crate::constants::MANAGER;
use crate::error::ApiError;
use crate::redaction::RedactedObject;
use crate::types::key::ObjectKey;
use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::KubeConfigOptions;
use kube::core::gvk::GroupVersion;
use kube::discovery::{pinned_kind, ApiCapabilities, ApiResource, Scope};
use kube::{Api, Client, Config as KConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Operations the engine needs on one cluster.
///
/// Bodies only go out as `RedactedObject`; nothing here accepts raw Secret payloads.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    fn cluster(&self) -> &str;

    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, ApiError>;

    /// Create (or take over) the object with server-side apply
    async fn create(&self, key: &ObjectKey, object: &RedactedObject) -> Result<(), ApiError>;

    /// Bring the object in line with `object`; Secret `data` is left untouched
    async fn update(&self, key: &ObjectKey, object: &RedactedObject) -> Result<(), ApiError>;

    /// Delete the object; an object that is already gone counts as deleted
    async fn delete(&self, key: &ObjectKey) -> Result<(), ApiError>;

    /// All objects of one type carrying `label_selector`, across namespaces
    async fn list_managed(
        &self,
        api_version: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ApiError>;

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ApiError>;

    /// Whether objects of this type live in a namespace
    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, ApiError>;
}

/// Opens clients for named clusters
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn ClusterClient>, ApiError>;
}

/// Connects to clusters through the kubeconfig context of the same name
#[derive(Clone, Default)]
pub struct KubeconfigConnector;

#[async_trait]
impl ClusterConnector for KubeconfigConnector {
    #[instrument(skip(self))]
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn ClusterClient>, ApiError> {
        let options = KubeConfigOptions {
            context: Some(cluster.to_string()),
            ..Default::default()
        };
        let config = KConfig::from_kubeconfig(&options)
            .await
            .map_err(|e| ApiError::Kubeconfig(format!("context '{}': {}", cluster, e)))?;
        let client = Client::try_from(config)
            .map_err(|e| ApiError::Kubeconfig(format!("Failed to create client: {}", e)))?;

        info!("Connected to cluster {}", cluster);
        Ok(Arc::new(KubeClusterClient::new(client, cluster)))
    }
}

pub struct KubeClusterClient {
    client: Client,
    cluster: String,
    types: Mutex<HashMap<(String, String), (ApiResource, ApiCapabilities)>>,
}

impl KubeClusterClient {
    pub fn new(client: Client, cluster: &str) -> Self {
        Self {
            client,
            cluster: cluster.to_string(),
            types: Mutex::new(HashMap::new()),
        }
    }

    /// Discover (and remember) how `kind` in `api_version` is served
    async fn resolve_type(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities), ApiError> {
        let cache_key = (api_version.to_string(), kind.to_string());
        if let Some(found) = self.types.lock().await.get(&cache_key) {
            return Ok(found.clone());
        }

        let unknown = || ApiError::UnknownType {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        };
        let gvk = GroupVersion::from_str(api_version)
            .map_err(|_| unknown())?
            .with_kind(kind);
        let found = match pinned_kind(&self.client, &gvk).await {
            Ok(found) => found,
            Err(kube::Error::Discovery(_)) => return Err(unknown()),
            Err(kube::Error::Api(response)) if response.code == 404 => return Err(unknown()),
            Err(err) => return Err(self.api_error(err)),
        };

        debug!("{} {} is {:?}-scoped", api_version, kind, found.1.scope);
        self.types.lock().await.insert(cache_key, found.clone());
        Ok(found)
    }

    async fn api(&self, key: &ObjectKey) -> Result<Api<DynamicObject>, ApiError> {
        let (resource, capabilities) = self.resolve_type(&key.api_version, &key.kind).await?;
        Ok(match capabilities.scope {
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                key.namespace.as_deref().unwrap_or("default"),
                &resource,
            ),
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        })
    }

    fn api_error(&self, err: kube::Error) -> ApiError {
        match err {
            kube::Error::HyperError(e) => ApiError::Unreachable {
                cluster: self.cluster.clone(),
                reason: e.to_string(),
            },
            kube::Error::Service(e) => ApiError::Unreachable {
                cluster: self.cluster.clone(),
                reason: e.to_string(),
            },
            other => other.into(),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn cluster(&self) -> &str {
        &self.cluster
    }

    #[instrument(skip(self), fields(cluster = %self.cluster, key = %key))]
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, ApiError> {
        let api = self.api(key).await?;
        api.get_opt(&key.name).await.map_err(|e| self.api_error(e))
    }

    #[instrument(skip(self, object), fields(cluster = %self.cluster, key = %key))]
    async fn create(&self, key: &ObjectKey, object: &RedactedObject) -> Result<(), ApiError> {
        let api = self.api(key).await?;
        let params = PatchParams::apply(MANAGER).force();
        api.patch(&key.name, &params, &Patch::Apply(object.object()))
            .await
            .map_err(|e| self.api_error(e))?;
        Ok(())
    }

    #[instrument(skip(self, object), fields(cluster = %self.cluster, key = %key))]
    async fn update(&self, key: &ObjectKey, object: &RedactedObject) -> Result<(), ApiError> {
        let api = self.api(key).await?;
        if object.is_secret() {
            // A merge patch without `data` leaves the operator-filled values in place
            let params = PatchParams {
                field_manager: Some(MANAGER.to_string()),
                ..Default::default()
            };
            api.patch(&key.name, &params, &Patch::Merge(secret_update_patch(object)))
                .await
                .map_err(|e| self.api_error(e))?;
        } else {
            let params = PatchParams::apply(MANAGER).force();
            api.patch(&key.name, &params, &Patch::Apply(object.object()))
                .await
                .map_err(|e| self.api_error(e))?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(cluster = %self.cluster, key = %key))]
    async fn delete(&self, key: &ObjectKey) -> Result<(), ApiError> {
        let api = self.api(key).await?;
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!("{} was already gone", key);
                Ok(())
            }
            Err(err) => Err(self.api_error(err)),
        }
    }

    #[instrument(skip(self), fields(cluster = %self.cluster))]
    async fn list_managed(
        &self,
        api_version: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ApiError> {
        let (resource, _) = self.resolve_type(api_version, kind).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| self.api_error(e))?;
        Ok(list.items)
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ApiError> {
        ensure_namespace_exists(&self.client, namespace)
            .await
            .map_err(|err| match err {
                ApiError::Namespace(reason) => ApiError::Namespace(format!(
                    "{} on cluster {}",
                    reason, self.cluster
                )),
                other => other,
            })
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, ApiError> {
        let (_, capabilities) = self.resolve_type(api_version, kind).await?;
        Ok(matches!(capabilities.scope, Scope::Namespaced))
    }
}

/// The Secret as a merge patch with its payload removed
pub(crate) fn secret_update_patch(object: &RedactedObject) -> Value {
    let mut value = object.to_value();
    if let Value::Object(fields) = &mut value {
        fields.remove("data");
        fields.remove("stringData");
    }
    value
}
