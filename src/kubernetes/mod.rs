// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes access: cluster clients, namespace bootstrap and managed-field projection.

pub mod client;
pub mod managed_fields;
pub mod namespaces;

pub use client::{ClusterClient, ClusterConnector, KubeClusterClient, KubeconfigConnector};
pub use managed_fields::project_managed;
pub use namespaces::ensure_namespace_exists;

use crate::error::ApiError;
use std::future::Future;
use std::time::Duration;

/// Run one cluster call under `timeout`
pub async fn with_timeout<T>(
    timeout: Duration,
    cluster: &str,
    operation: impl Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| ApiError::Timeout(cluster.to_string()))?
}
