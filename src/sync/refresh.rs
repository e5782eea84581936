// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Live cluster state back into the store.

use crate::constants::{labels, MANAGER};
use crate::diff::{Plan, PlanEntry};
use crate::error::{ApiError, Result};
use crate::kubernetes::{project_managed, with_timeout, ClusterClient, ClusterConnector};
use crate::redaction::RedactedObject;
use crate::store::{ObjectRecord, StateStore};
use crate::types::key::{KeyFilter, ObjectKey};
use futures::stream::{self, StreamExt};
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Types looked for on every cluster, even when none are tracked there yet
const RENDERED_TYPES: [(&str, &str); 2] = [("apps/v1", "Deployment"), ("v1", "Service")];

/// What a refresh found.
///
/// `changes` reads like a plan from the store's point of view: creates are newly discovered
/// objects, updates are drifted records and deletes are objects gone from their cluster.
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub changes: Plan,
    pub unreachable: BTreeMap<String, ApiError>,
    pub failed: BTreeMap<ObjectKey, ApiError>,
}

#[derive(Default)]
struct ClusterScan {
    changes: Plan,
    failed: BTreeMap<ObjectKey, ApiError>,
}

pub struct RefreshFlow {
    connector: Arc<dyn ClusterConnector>,
    store: Arc<dyn StateStore>,
    concurrency: usize,
    timeout: Duration,
    label_namespace: String,
}

impl RefreshFlow {
    pub fn new(
        connector: Arc<dyn ClusterConnector>,
        store: Arc<dyn StateStore>,
        concurrency: usize,
        timeout: Duration,
        label_namespace: &str,
    ) -> Self {
        Self {
            connector,
            store,
            concurrency: concurrency.max(1),
            timeout,
            label_namespace: label_namespace.to_string(),
        }
    }

    /// Scan and write the findings to the store in one go
    pub async fn refresh(&self, filter: &KeyFilter, actor: &str) -> Result<RefreshReport> {
        let report = self.scan(filter).await?;
        self.commit(&report, actor).await?;
        Ok(report)
    }

    /// Compare live objects with the store without writing anything
    #[instrument(skip_all)]
    pub async fn scan(&self, filter: &KeyFilter) -> Result<RefreshReport> {
        let recorded = self.store.load().await?;

        let mut clusters: BTreeMap<String, Vec<ObjectRecord>> = BTreeMap::new();
        for (key, record) in recorded {
            if filter.matches(&key) {
                clusters.entry(key.cluster.clone()).or_default().push(record);
            }
        }
        if let Some(cluster) = &filter.cluster {
            clusters.entry(cluster.clone()).or_default();
        }

        let scans: Vec<_> = stream::iter(clusters)
            .map(|(cluster, records)| async move {
                let result = self.scan_cluster(&cluster, records, filter).await;
                (cluster, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = RefreshReport::default();
        for (cluster, scan) in scans {
            match scan {
                Ok(scan) => {
                    report.changes.creates.extend(scan.changes.creates);
                    report.changes.updates.extend(scan.changes.updates);
                    report.changes.deletes.extend(scan.changes.deletes);
                    report.changes.unchanged.extend(scan.changes.unchanged);
                    report.failed.extend(scan.failed);
                }
                Err(err) => {
                    warn!("Skipping unreachable cluster {}: {}", cluster, err);
                    report.unreachable.insert(cluster, err);
                }
            }
        }

        let changes = &mut report.changes;
        for entries in [&mut changes.creates, &mut changes.updates, &mut changes.deletes] {
            entries.sort_by(|a, b| a.key.cmp(&b.key));
        }
        changes.unchanged.sort();
        info!(
            "Refresh found {} new, {} drifted, {} gone, {} unreachable clusters",
            changes.creates.len(),
            changes.updates.len(),
            changes.deletes.len(),
            report.unreachable.len()
        );
        Ok(report)
    }

    /// Write the findings of a scan to the store
    #[instrument(skip_all)]
    pub async fn commit(&self, report: &RefreshReport, actor: &str) -> Result<()> {
        let changes = &report.changes;
        for entry in changes.creates.iter().chain(changes.updates.iter()) {
            if let Some(body) = &entry.after {
                self.store.put(&entry.key, &entry.owner, body, actor).await?;
            }
        }
        for entry in &changes.deletes {
            self.store.remove(&entry.key, actor).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, records, filter))]
    async fn scan_cluster(
        &self,
        cluster: &str,
        records: Vec<ObjectRecord>,
        filter: &KeyFilter,
    ) -> std::result::Result<ClusterScan, ApiError> {
        let client = with_timeout(self.timeout, cluster, self.connector.connect(cluster)).await?;
        let mut scan = ClusterScan::default();

        let mut types: BTreeSet<(String, String)> = RENDERED_TYPES
            .iter()
            .map(|(api_version, kind)| (api_version.to_string(), kind.to_string()))
            .collect();
        types.extend(
            records
                .iter()
                .map(|r| (r.key.api_version.clone(), r.key.kind.clone())),
        );

        let tracked: BTreeSet<&ObjectKey> = records.iter().map(|r| &r.key).collect();
        for (api_version, kind) in &types {
            for live in self.discover(&*client, api_version, kind).await? {
                let key = ObjectKey::new(
                    cluster,
                    api_version.as_str(),
                    kind.as_str(),
                    live.metadata.namespace.as_deref(),
                    live.metadata.name.clone().unwrap_or_default(),
                );
                if is_tracked(&tracked, &key) || !filter.matches(&key) {
                    continue;
                }
                match record_body(&key, live) {
                    Ok(body) => {
                        debug!("Discovered {}", key);
                        let owner = owner_of(&self.label_namespace, &body)
                            .unwrap_or_else(|| "unknown".to_string());
                        scan.changes.creates.push(PlanEntry {
                            key,
                            owner,
                            before: None,
                            after: Some(body),
                            recreate: false,
                        });
                    }
                    Err(err) => {
                        scan.failed.insert(key, err);
                    }
                }
            }
        }

        for record in records {
            let key = record.key.clone();
            let live = match with_timeout(self.timeout, cluster, client.get(&key)).await {
                Ok(live) => live,
                Err(err @ (ApiError::Unreachable { .. } | ApiError::Timeout(_))) => return Err(err),
                Err(err) => {
                    scan.failed.insert(key, err);
                    continue;
                }
            };

            let Some(live) = live else {
                debug!("{} is gone", key);
                scan.changes.deletes.push(PlanEntry {
                    key,
                    owner: record.owner,
                    before: Some(record.body),
                    after: None,
                    recreate: false,
                });
                continue;
            };

            match record_body(&key, live) {
                Ok(body) if body == record.body => scan.changes.unchanged.push(key),
                Ok(body) => scan.changes.updates.push(PlanEntry {
                    key,
                    owner: record.owner,
                    before: Some(record.body),
                    after: Some(body),
                    recreate: false,
                }),
                Err(err) => {
                    scan.failed.insert(key, err);
                }
            }
        }

        Ok(scan)
    }

    /// Manager-labelled objects of one type; types the cluster does not serve yield nothing
    async fn discover(
        &self,
        client: &dyn ClusterClient,
        api_version: &str,
        kind: &str,
    ) -> std::result::Result<Vec<DynamicObject>, ApiError> {
        let selector = format!("{}/{}={}", self.label_namespace, labels::MANAGED_BY, MANAGER);
        let listed = with_timeout(
            self.timeout,
            client.cluster(),
            client.list_managed(api_version, kind, &selector),
        )
        .await;
        match listed {
            Ok(objects) => Ok(objects),
            Err(err @ (ApiError::Unreachable { .. } | ApiError::Timeout(_))) => Err(err),
            Err(err) => {
                debug!("Not discovering {} {}: {}", api_version, kind, err);
                Ok(Vec::new())
            }
        }
    }
}

/// The redacted projection of a live object, as it would have been recorded
pub(super) fn record_body(
    key: &ObjectKey,
    mut live: DynamicObject,
) -> std::result::Result<RedactedObject, ApiError> {
    // List responses omit the type of their items
    live.types = Some(TypeMeta {
        api_version: key.api_version.clone(),
        kind: key.kind.clone(),
    });
    project_managed(&live, MANAGER).map(RedactedObject::redact)
}

/// The owning resource named by the owner annotation, if any
pub(super) fn owner_of(label_namespace: &str, body: &RedactedObject) -> Option<String> {
    let annotation = format!("{}/{}", label_namespace, labels::OWNER);
    body.object()
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(&annotation))
        .cloned()
}

/// Whether a discovered object already has a record.
///
/// Cluster-scoped objects are listed without a namespace; a record that still carries one maps
/// onto the same live object.
fn is_tracked(tracked: &BTreeSet<&ObjectKey>, key: &ObjectKey) -> bool {
    tracked.contains(key)
        || (key.namespace.is_none()
            && tracked.iter().any(|t| {
                t.cluster == key.cluster
                    && t.api_version == key.api_version
                    && t.kind == key.kind
                    && t.name == key.name
            }))
}
