// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Adopting objects that already live on a cluster.

use super::refresh::{owner_of, record_body};
use crate::error::{ConvoyError, Result};
use crate::kubernetes::{with_timeout, ClusterConnector};
use crate::redaction::RedactedObject;
use crate::store::StateStore;
use crate::types::key::ObjectKey;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Owner recorded for imported objects that carry no owner annotation
pub const IMPORTED_OWNER: &str = "imported";

/// A live object as it would be recorded
#[derive(Debug)]
pub struct ImportPreview {
    pub key: ObjectKey,
    pub owner: String,
    pub body: RedactedObject,
}

/// Records an untracked live object so later plans update it instead of creating it
pub struct ImportFlow {
    connector: Arc<dyn ClusterConnector>,
    store: Arc<dyn StateStore>,
    timeout: Duration,
    label_namespace: String,
}

impl ImportFlow {
    pub fn new(
        connector: Arc<dyn ClusterConnector>,
        store: Arc<dyn StateStore>,
        timeout: Duration,
        label_namespace: &str,
    ) -> Self {
        Self {
            connector,
            store,
            timeout,
            label_namespace: label_namespace.to_string(),
        }
    }

    /// Fetch the live object for `key` without writing anything
    #[instrument(skip(self), fields(key = %key))]
    pub async fn preview(&self, key: &ObjectKey) -> Result<ImportPreview> {
        if self.store.get(key).await?.is_some() {
            return Err(import_error(key, "it is already tracked"));
        }

        let api_error = |source| ConvoyError::Api {
            key: key.clone(),
            source,
        };
        let cluster = key.cluster.as_str();
        let client = with_timeout(self.timeout, cluster, self.connector.connect(cluster))
            .await
            .map_err(api_error)?;

        let namespaced = with_timeout(
            self.timeout,
            cluster,
            client.is_namespaced(&key.api_version, &key.kind),
        )
        .await
        .map_err(api_error)?;
        match (&key.namespace, namespaced) {
            (Some(_), false) => {
                return Err(import_error(key, format!("{} is cluster-scoped", key.kind)));
            }
            (None, true) => {
                return Err(import_error(key, format!("{} needs a namespace", key.kind)));
            }
            _ => {}
        }

        let live = with_timeout(self.timeout, cluster, client.get(key))
            .await
            .map_err(api_error)?
            .ok_or_else(|| import_error(key, "it does not exist on the cluster"))?;
        let body = record_body(key, live).map_err(api_error)?;
        let owner = owner_of(&self.label_namespace, &body)
            .unwrap_or_else(|| IMPORTED_OWNER.to_string());

        Ok(ImportPreview {
            key: key.clone(),
            owner,
            body,
        })
    }

    /// Record a previewed object
    pub async fn commit(&self, preview: &ImportPreview, actor: &str) -> Result<()> {
        self.store
            .put(&preview.key, &preview.owner, &preview.body, actor)
            .await?;
        info!("Imported {} as {}", preview.key, preview.owner);
        Ok(())
    }
}

fn import_error(key: &ObjectKey, reason: impl ToString) -> ConvoyError {
    ConvoyError::Import {
        key: key.clone(),
        reason: reason.to_string(),
    }
}
