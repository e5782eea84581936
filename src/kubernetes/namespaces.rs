// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Namespace bootstrap on target clusters

use crate::error::ApiError;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client,
};
use tracing::{debug, info, instrument};

/// Ensure a namespace exists in the cluster, create if it doesn't
#[instrument(skip(client))]
pub async fn ensure_namespace_exists(client: &Client, namespace: &str) -> Result<(), ApiError> {
    let namespaces: Api<Namespace> = Api::all(client.clone());

    match namespaces.get_opt(namespace).await {
        Ok(Some(_)) => {
            debug!("Namespace {} already exists", namespace);
            Ok(())
        }
        Ok(None) => {
            info!("Creating namespace {}", namespace);
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(namespace.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            match namespaces.create(&PostParams::default(), &ns).await {
                Ok(_) => Ok(()),
                // Lost a race with another writer
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
                Err(e) => Err(ApiError::Namespace(format!(
                    "Failed to create namespace {}: {}",
                    namespace, e
                ))),
            }
        }
        Err(e) => Err(ApiError::Namespace(format!(
            "Failed to check namespace {}: {}",
            namespace, e
        ))),
    }
}
