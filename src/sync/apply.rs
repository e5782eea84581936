// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Executes a confirmed plan against the target clusters.

use crate::diff::{ConfirmedPlan, PlanEntry};
use crate::error::{ApiError, ConvoyError, Result, StoreError};
use crate::kubernetes::{with_timeout, ClusterClient, ClusterConnector};
use crate::store::StateStore;
use crate::types::key::ObjectKey;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Outcome per object. Failed objects are left as they were; nothing is rolled back.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: Vec<ObjectKey>,
    pub failed: BTreeMap<ObjectKey, ConvoyError>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Work for one cluster, in execution order
#[derive(Default)]
struct ClusterBatch {
    deletes: Vec<PlanEntry>,
    creates: Vec<PlanEntry>,
    updates: Vec<PlanEntry>,
}

impl ClusterBatch {
    fn entries(&self) -> impl Iterator<Item = &PlanEntry> {
        self.deletes
            .iter()
            .chain(self.creates.iter())
            .chain(self.updates.iter())
    }
}

pub struct ApplyExecutor {
    connector: Arc<dyn ClusterConnector>,
    store: Arc<dyn StateStore>,
    concurrency: usize,
    timeout: Duration,
}

impl ApplyExecutor {
    pub fn new(
        connector: Arc<dyn ClusterConnector>,
        store: Arc<dyn StateStore>,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            connector,
            store,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Apply every entry of `confirmed`.
    ///
    /// Clusters run concurrently, at most `concurrency` at a time. Within a cluster deletes run
    /// first, then creates, then updates. A store failure aborts the invocation.
    #[instrument(skip_all, fields(changes = confirmed.plan.len()))]
    pub async fn apply(&self, confirmed: ConfirmedPlan) -> Result<ApplyReport> {
        let ConfirmedPlan { plan, actor } = confirmed;

        let mut batches: BTreeMap<String, ClusterBatch> = BTreeMap::new();
        for entry in plan.deletes {
            batches.entry(entry.key.cluster.clone()).or_default().deletes.push(entry);
        }
        for entry in plan.creates {
            batches.entry(entry.key.cluster.clone()).or_default().creates.push(entry);
        }
        for entry in plan.updates {
            batches.entry(entry.key.cluster.clone()).or_default().updates.push(entry);
        }

        let outcomes: Vec<_> = stream::iter(batches)
            .map(|(cluster, batch)| {
                let actor = actor.as_str();
                async move { self.apply_cluster(&cluster, batch, actor).await }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = ApplyReport::default();
        let mut store_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(cluster_report) => {
                    report.applied.extend(cluster_report.applied);
                    report.failed.extend(cluster_report.failed);
                }
                Err(err) => {
                    store_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = store_error {
            return Err(err.into());
        }

        report.applied.sort();
        info!(
            "Applied {} objects, {} failed",
            report.applied.len(),
            report.failed.len()
        );
        Ok(report)
    }

    #[instrument(skip(self, batch, actor))]
    async fn apply_cluster(
        &self,
        cluster: &str,
        batch: ClusterBatch,
        actor: &str,
    ) -> std::result::Result<ApplyReport, StoreError> {
        let mut report = ApplyReport::default();

        let client = match with_timeout(self.timeout, cluster, self.connector.connect(cluster)).await
        {
            Ok(client) => client,
            Err(err) => {
                error!("Cannot reach cluster {}: {}", cluster, err);
                for entry in batch.entries() {
                    report.failed.insert(entry.key.clone(), api_failure(&entry.key, err.clone()));
                }
                return Ok(report);
            }
        };

        for entry in &batch.deletes {
            let result = with_timeout(self.timeout, cluster, client.delete(&entry.key)).await;
            match result {
                Ok(()) => {
                    self.store.remove(&entry.key, actor).await?;
                    info!("Deleted {}", entry.key);
                    report.applied.push(entry.key.clone());
                }
                Err(err) => record_failure(&mut report, &entry.key, err),
            }
        }

        let namespaces: BTreeSet<&str> = batch
            .creates
            .iter()
            .chain(batch.updates.iter().filter(|e| e.recreate))
            .filter_map(|e| e.key.namespace.as_deref())
            .collect();
        let mut broken_namespaces = BTreeMap::new();
        for namespace in namespaces {
            if let Err(err) =
                with_timeout(self.timeout, cluster, client.ensure_namespace(namespace)).await
            {
                warn!("Namespace {} unavailable on {}: {}", namespace, cluster, err);
                broken_namespaces.insert(namespace.to_string(), err);
            }
        }
        let namespace_error = |key: &ObjectKey| {
            key.namespace
                .as_ref()
                .and_then(|ns| broken_namespaces.get(ns))
                .cloned()
        };

        for entry in &batch.creates {
            if let Some(err) = namespace_error(&entry.key) {
                record_failure(&mut report, &entry.key, err);
                continue;
            }
            match self.write(&*client, entry, false).await {
                Ok(()) => {
                    self.store_desired(entry, actor).await?;
                    info!("Created {}", entry.key);
                    report.applied.push(entry.key.clone());
                }
                Err(err) => record_failure(&mut report, &entry.key, err),
            }
        }

        for entry in &batch.updates {
            if entry.recreate {
                if let Some(err) = namespace_error(&entry.key) {
                    record_failure(&mut report, &entry.key, err);
                    continue;
                }
            }
            match self.write(&*client, entry, entry.recreate).await {
                Ok(()) => {
                    self.store_desired(entry, actor).await?;
                    let verb = if entry.recreate { "Recreated" } else { "Updated" };
                    info!("{} {}", verb, entry.key);
                    report.applied.push(entry.key.clone());
                }
                Err(err) => record_failure(&mut report, &entry.key, err),
            }
        }

        Ok(report)
    }

    /// Push the desired body of `entry` to the cluster
    async fn write(
        &self,
        client: &dyn ClusterClient,
        entry: &PlanEntry,
        recreate: bool,
    ) -> std::result::Result<(), ApiError> {
        let cluster = client.cluster();
        let Some(body) = &entry.after else {
            return Err(ApiError::InvalidObject(format!("{} has no desired body", entry.key)));
        };

        if recreate {
            with_timeout(self.timeout, cluster, client.delete(&entry.key)).await?;
            with_timeout(self.timeout, cluster, client.create(&entry.key, body)).await
        } else if entry.before.is_none() && !self.secret_exists(client, &entry.key).await? {
            with_timeout(self.timeout, cluster, client.create(&entry.key, body)).await
        } else {
            with_timeout(self.timeout, cluster, client.update(&entry.key, body)).await
        }
    }

    /// An untracked Secret already on the cluster keeps its data: it is updated, not created
    async fn secret_exists(
        &self,
        client: &dyn ClusterClient,
        key: &ObjectKey,
    ) -> std::result::Result<bool, ApiError> {
        if !key.is_secret() {
            return Ok(false);
        }
        let live = with_timeout(self.timeout, client.cluster(), client.get(key)).await?;
        if live.is_some() {
            warn!("{} already exists, keeping its data", key);
        }
        Ok(live.is_some())
    }

    async fn store_desired(
        &self,
        entry: &PlanEntry,
        actor: &str,
    ) -> std::result::Result<(), StoreError> {
        match &entry.after {
            Some(body) => self.store.put(&entry.key, &entry.owner, body, actor).await,
            None => Ok(()),
        }
    }
}

fn api_failure(key: &ObjectKey, source: ApiError) -> ConvoyError {
    ConvoyError::Api {
        key: key.clone(),
        source,
    }
}

fn record_failure(report: &mut ApplyReport, key: &ObjectKey, err: ApiError) {
    error!("Failed to apply {}: {}", key, err);
    report.failed.insert(key.clone(), api_failure(key, err));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Plan;
    use crate::redaction::RedactedObject;
    use crate::test_utils::{make_store, FakeCluster, FakeConnector};
    use serde_json::json;

    const OWNER: &str = "KubernetesYaml shop/extras";

    fn make_key(cluster: &str, name: &str) -> ObjectKey {
        ObjectKey::new(cluster, "v1", "ConfigMap", Some("shop"), name)
    }

    fn make_body(name: &str, value: &str) -> RedactedObject {
        RedactedObject::redact(
            serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": "shop"},
                "data": {"value": value},
            }))
            .unwrap(),
        )
    }

    fn make_entry(key: ObjectKey, before: Option<RedactedObject>, after: Option<RedactedObject>) -> PlanEntry {
        PlanEntry {
            key,
            owner: OWNER.to_string(),
            before,
            after,
            recreate: false,
        }
    }

    async fn make_executor(connector: FakeConnector) -> (ApplyExecutor, Arc<crate::store::SqlStateStore>) {
        let store = Arc::new(make_store().await);
        let executor = ApplyExecutor::new(
            Arc::new(connector),
            store.clone(),
            4,
            Duration::from_secs(5),
        );
        (executor, store)
    }

    #[tokio::test]
    async fn test_order_within_cluster() {
        let cluster = FakeCluster::new("us-east");
        cluster.insert(&make_key("us-east", "old"), &make_body("old", "1"));
        cluster.insert(&make_key("us-east", "changed"), &make_body("changed", "1"));
        let (executor, _) = make_executor(FakeConnector::new(vec![cluster.clone()])).await;

        let plan = Plan {
            updates: vec![make_entry(
                make_key("us-east", "changed"),
                Some(make_body("changed", "1")),
                Some(make_body("changed", "2")),
            )],
            creates: vec![make_entry(make_key("us-east", "new"), None, Some(make_body("new", "1")))],
            deletes: vec![make_entry(make_key("us-east", "old"), Some(make_body("old", "1")), None)],
            ..Default::default()
        };

        let report = executor.apply(plan.confirm("alice")).await.unwrap();

        assert!(report.is_success());
        let operations: Vec<String> = cluster
            .operations()
            .into_iter()
            .filter(|op| !op.starts_with("ensure"))
            .collect();
        assert_eq!(
            operations,
            vec!["delete old", "create new", "update changed"]
        );
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let east = FakeCluster::new("us-east");
        let west = FakeCluster::new("eu-west");
        east.fail_on(&make_key("us-east", "b"));
        let (executor, store) =
            make_executor(FakeConnector::new(vec![east.clone(), west.clone()])).await;

        let plan = Plan {
            creates: vec![
                make_entry(make_key("eu-west", "a"), None, Some(make_body("a", "1"))),
                make_entry(make_key("us-east", "a"), None, Some(make_body("a", "1"))),
                make_entry(make_key("us-east", "b"), None, Some(make_body("b", "1"))),
            ],
            ..Default::default()
        };

        let report = executor.apply(plan.confirm("alice")).await.unwrap();

        assert_eq!(report.applied.len(), 2);
        assert!(report.failed.contains_key(&make_key("us-east", "b")));
        assert!(east.get_live(&make_key("us-east", "a")).is_some());
        assert!(east.get_live(&make_key("us-east", "b")).is_none());
        assert!(west.get_live(&make_key("eu-west", "a")).is_some());

        let recorded = store.load().await.unwrap();
        assert!(recorded.contains_key(&make_key("us-east", "a")));
        assert!(recorded.contains_key(&make_key("eu-west", "a")));
        assert!(!recorded.contains_key(&make_key("us-east", "b")));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_fails_its_entries() {
        let east = FakeCluster::new("us-east");
        let (executor, store) = make_executor(FakeConnector::new(vec![east.clone()])).await;

        let plan = Plan {
            creates: vec![
                make_entry(make_key("us-east", "a"), None, Some(make_body("a", "1"))),
                make_entry(make_key("mars", "a"), None, Some(make_body("a", "1"))),
            ],
            ..Default::default()
        };

        let report = executor.apply(plan.confirm("alice")).await.unwrap();

        assert_eq!(report.applied, vec![make_key("us-east", "a")]);
        assert!(matches!(
            report.failed[&make_key("mars", "a")],
            ConvoyError::Api {
                source: ApiError::Unreachable { .. },
                ..
            }
        ));
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_namespace_is_ensured_before_create() {
        let east = FakeCluster::new("us-east");
        let (executor, _) = make_executor(FakeConnector::new(vec![east.clone()])).await;

        let plan = Plan {
            creates: vec![make_entry(make_key("us-east", "a"), None, Some(make_body("a", "1")))],
            ..Default::default()
        };
        executor.apply(plan.confirm("alice")).await.unwrap();

        assert_eq!(east.operations(), vec!["ensure shop", "create a"]);
    }

    #[tokio::test]
    async fn test_secret_update_keeps_cluster_data() {
        let east = FakeCluster::new("us-east");
        let key = ObjectKey::new("us-east", "v1", "Secret", Some("shop"), "web");
        let secret = |label: &str| {
            RedactedObject::redact(
                serde_json::from_value(json!({
                    "apiVersion": "v1",
                    "kind": "Secret",
                    "metadata": {"name": "web", "namespace": "shop", "labels": {"tier": label}},
                    "data": {"token": "x"},
                }))
                .unwrap(),
            )
        };
        east.insert_raw(
            &key,
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "web", "namespace": "shop", "labels": {"tier": "a"}},
                "data": {"token": "cmVhbA=="},
            }),
        );
        let (executor, store) = make_executor(FakeConnector::new(vec![east.clone()])).await;

        let plan = Plan {
            updates: vec![make_entry(key.clone(), Some(secret("a")), Some(secret("b")))],
            ..Default::default()
        };
        executor.apply(plan.confirm("alice")).await.unwrap();

        let live = east.get_live(&key).unwrap();
        assert_eq!(live["data"]["token"], json!("cmVhbA=="));
        assert_eq!(live["metadata"]["labels"]["tier"], json!("b"));
        let stored = store.get(&key).await.unwrap().unwrap();
        assert!(!stored.body.to_value().to_string().contains("cmVhbA=="));
    }

    #[tokio::test]
    async fn test_secret_create_keeps_existing_data() {
        let east = FakeCluster::new("us-east");
        let key = ObjectKey::new("us-east", "v1", "Secret", Some("shop"), "web");
        east.insert_raw(
            &key,
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "web", "namespace": "shop"},
                "data": {"token": "cmVhbC1vcGVyYXRvci12YWx1ZQ=="},
            }),
        );
        let (executor, store) = make_executor(FakeConnector::new(vec![east.clone()])).await;
        let declared = RedactedObject::redact(
            serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "web", "namespace": "shop", "labels": {"tier": "a"}},
                "stringData": {"token": "declared"},
            }))
            .unwrap(),
        );

        let plan = Plan {
            creates: vec![make_entry(key.clone(), None, Some(declared))],
            ..Default::default()
        };
        let report = executor.apply(plan.confirm("alice")).await.unwrap();

        assert!(report.is_success());
        assert_eq!(east.operations(), vec!["ensure shop", "update web"]);
        let live = east.get_live(&key).unwrap();
        assert_eq!(live["data"]["token"], json!("cmVhbC1vcGVyYXRvci12YWx1ZQ=="));
        assert_eq!(live["metadata"]["labels"]["tier"], json!("a"));
        assert!(store.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_new_secret_is_created() {
        let east = FakeCluster::new("us-east");
        let key = ObjectKey::new("us-east", "v1", "Secret", Some("shop"), "web");
        let (executor, _) = make_executor(FakeConnector::new(vec![east.clone()])).await;
        let declared = RedactedObject::redact(
            serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "web", "namespace": "shop"},
                "data": {"token": "x"},
            }))
            .unwrap(),
        );

        let plan = Plan {
            creates: vec![make_entry(key, None, Some(declared))],
            ..Default::default()
        };
        executor.apply(plan.confirm("alice")).await.unwrap();

        assert_eq!(east.operations(), vec!["ensure shop", "create web"]);
    }

    #[tokio::test]
    async fn test_recreate_deletes_then_creates() {
        let east = FakeCluster::new("us-east");
        east.insert(&make_key("us-east", "a"), &make_body("a", "1"));
        let (executor, _) = make_executor(FakeConnector::new(vec![east.clone()])).await;

        let mut entry = make_entry(
            make_key("us-east", "a"),
            Some(make_body("a", "1")),
            Some(make_body("a", "2")),
        );
        entry.recreate = true;
        let plan = Plan {
            updates: vec![entry],
            ..Default::default()
        };
        executor.apply(plan.confirm("alice")).await.unwrap();

        assert_eq!(east.operations(), vec!["ensure shop", "delete a", "create a"]);
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() {
        let east = FakeCluster::new("us-east");
        let (executor, store) = make_executor(FakeConnector::new(vec![east])).await;
        let key = make_key("us-east", "gone");
        store.put(&key, OWNER, &make_body("gone", "1"), "alice").await.unwrap();

        let plan = Plan {
            deletes: vec![make_entry(key.clone(), Some(make_body("gone", "1")), None)],
            ..Default::default()
        };
        let report = executor.apply(plan.confirm("alice")).await.unwrap();

        assert!(report.is_success());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
