// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities: a mock Kubernetes API, and in-memory registry and cluster fakes.

use crate::error::{ApiError, RegistryError};
use crate::kubernetes::{ClusterClient, ClusterConnector};
use crate::redaction::RedactedObject;
use crate::registry::config_image::tests::make_layer;
use crate::registry::{Digest, ImageReference, RegistryClient, OCI_MANIFEST};
use crate::store::SqlStateStore;
use crate::types::key::ObjectKey;
use crate::types::resource::{
    DeclaredResource, DeploymentConfig, DeploymentResource, FootprintEntry,
    KubernetesYamlResource, Resource, ResourceMetadata,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use kube::api::DynamicObject;
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A request seen by `MockService`
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
}

/// A mock HTTP service that returns predefined responses based on request paths.
#[derive(Clone)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), (u16, String)>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Respond to `method` requests on `path` (or anything below it)
    pub fn on(self, method: &str, path: &str, status: u16, body: &str) -> Self {
        self.responses.lock().unwrap().insert(
            (method.to_string(), path.to_string()),
            (status, body.to_string()),
        );
        self
    }

    pub fn on_get(self, path: &str, status: u16, body: &str) -> Self {
        self.on("GET", path, status, body)
    }

    pub fn on_post(self, path: &str, status: u16, body: &str) -> Self {
        self.on("POST", path, status, body)
    }

    pub fn on_patch(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PATCH", path, status, body)
    }

    pub fn on_delete(self, path: &str, status: u16, body: &str) -> Self {
        self.on("DELETE", path, status, body)
    }

    /// Build a kube Client from this mock service
    pub fn into_client(self) -> Client {
        Client::new(self, "default")
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn find_response(&self, method: &str, path: &str) -> Option<(u16, String)> {
        let responses = self.responses.lock().unwrap();

        // Exact match first, then the longest registered prefix
        if let Some(resp) = responses.get(&(method.to_string(), path.to_string())) {
            return Some(resp.clone());
        }
        responses
            .iter()
            .filter(|((m, p), _)| m == method && path.starts_with(&format!("{}/", p)))
            .max_by_key(|((_, p), _)| p.len())
            .map(|(_, resp)| resp.clone())
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let content_type = req
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.requests.lock().unwrap().push(RecordedRequest {
            method: method.clone(),
            path: path.clone(),
            content_type,
        });

        let (status, body) = self
            .find_response(&method, &path)
            .unwrap_or_else(|| (404, not_found_json("", &path)));

        Box::pin(async move {
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body.into_bytes()))
                .unwrap())
        })
    }
}

/// Create a mock namespace JSON response
pub fn namespace_json(name: &str) -> String {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "uid": "test-uid"
        }
    })
    .to_string()
}

/// Create a 404 not found response
pub fn not_found_json(resource: &str, name: &str) -> String {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{} \"{}\" not found", resource, name),
        "reason": "NotFound",
        "code": 404
    })
    .to_string()
}

/// Discovery response for one group version; resources are `(plural, kind, namespaced)`
pub fn api_resource_list_json(group_version: &str, resources: &[(&str, &str, bool)]) -> String {
    let resources: Vec<Value> = resources
        .iter()
        .map(|(plural, kind, namespaced)| {
            json!({
                "name": plural,
                "singularName": kind.to_lowercase(),
                "namespaced": namespaced,
                "kind": kind,
                "verbs": ["create", "delete", "get", "list", "patch", "update", "watch"],
            })
        })
        .collect();
    json!({
        "kind": "APIResourceList",
        "apiVersion": "v1",
        "groupVersion": group_version,
        "resources": resources,
    })
    .to_string()
}

pub async fn make_store() -> SqlStateStore {
    SqlStateStore::connect("sqlite::memory:", Duration::from_secs(5))
        .await
        .unwrap()
}

#[derive(Default)]
struct RegistryState {
    /// `name:tag` to digest
    tags: HashMap<String, Digest>,
    /// `name@digest` to content
    manifests: HashMap<String, Bytes>,
    blobs: HashMap<String, Bytes>,
    calls: usize,
    unreachable: bool,
    corrupt_blobs: bool,
}

/// In-memory registry; clones share their contents
#[derive(Clone, Default)]
pub struct FakeRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a manifest under `name:tag`, returning its digest
    pub fn push_manifest(&self, name: &str, tag: &str, content: &[u8]) -> Digest {
        let digest = Digest::of(content);
        let mut state = self.state.lock().unwrap();
        state
            .manifests
            .insert(format!("{}@{}", name, digest), Bytes::copy_from_slice(content));
        state.tags.insert(format!("{}:{}", name, tag), digest.clone());
        digest
    }

    /// Store a config image pairing with `binary_name@binary_digest`
    pub fn push_config_image(
        &self,
        name: &str,
        tag: &str,
        binary_name: &str,
        binary_digest: &Digest,
        definition: &str,
    ) -> Digest {
        let index = json!({
            "binary_image": binary_name,
            "binary_digest": binary_digest.to_string(),
            "config_entrypoint": "config/app.yaml",
        })
        .to_string();
        let layer = make_layer(&[
            ("index.json", index.as_bytes()),
            ("config/app.yaml", definition.as_bytes()),
        ]);
        let layer_digest = Digest::of(&layer);
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(format!("{}@{}", name, layer_digest), Bytes::from(layer.clone()));

        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer_digest.to_string(),
                "size": layer.len(),
            }],
        })
        .to_string();
        self.push_manifest(name, tag, manifest.as_bytes())
    }

    /// `registry.example.com/web-config:latest` pairing with `registry.example.com/web:1.0`
    pub fn push_web_config(&self, definition: &str) -> Digest {
        let binary = self.push_manifest("registry.example.com/web", "1.0", b"binary");
        self.push_config_image(
            "registry.example.com/web-config",
            "latest",
            "registry.example.com/web",
            &binary,
            definition,
        )
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Serve every blob with content that does not match its digest
    pub fn corrupt_blobs(&self) {
        self.state.lock().unwrap().corrupt_blobs = true;
    }

    fn enter(&self, image: &ImageReference) -> Result<std::sync::MutexGuard<'_, RegistryState>, RegistryError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if state.unreachable {
            return Err(RegistryError::Unreachable {
                reference: image.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(state)
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn resolve_digest(&self, image: &ImageReference) -> Result<Digest, RegistryError> {
        let state = self.enter(image)?;
        let not_found = || RegistryError::NotFound {
            reference: image.to_string(),
        };
        match &image.digest {
            Some(digest) => state
                .manifests
                .contains_key(&format!("{}@{}", image.name(), digest))
                .then(|| digest.clone())
                .ok_or_else(not_found),
            None => {
                let tag = image.tag.as_deref().unwrap_or("latest");
                state
                    .tags
                    .get(&format!("{}:{}", image.name(), tag))
                    .cloned()
                    .ok_or_else(not_found)
            }
        }
    }

    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        digest: &Digest,
    ) -> Result<Bytes, RegistryError> {
        let state = self.enter(image)?;
        state
            .manifests
            .get(&format!("{}@{}", image.name(), digest))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                reference: format!("{}@{}", image.name(), digest),
            })
    }

    async fn fetch_blob(&self, image: &ImageReference, digest: &Digest) -> Result<Bytes, RegistryError> {
        let state = self.enter(image)?;
        let blob = state
            .blobs
            .get(&format!("{}@{}", image.name(), digest))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                reference: format!("{}@{}", image.name(), digest),
            })?;
        if state.corrupt_blobs {
            let mut corrupted = blob.to_vec();
            corrupted.push(0);
            return Ok(Bytes::from(corrupted));
        }
        Ok(blob)
    }
}

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<ObjectKey, Value>,
    operations: Vec<String>,
    failing: BTreeSet<ObjectKey>,
}

/// In-memory cluster; clones share their contents
#[derive(Clone)]
pub struct FakeCluster {
    name: String,
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(ClusterState::default())),
        }
    }

    /// Seed an object without recording an operation
    pub fn insert(&self, key: &ObjectKey, object: &RedactedObject) {
        self.insert_raw(key, object.to_value());
    }

    pub fn insert_raw(&self, key: &ObjectKey, object: Value) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(locate(key), stored(key, object));
    }

    /// Make every write to `key` fail
    pub fn fail_on(&self, key: &ObjectKey) {
        self.state.lock().unwrap().failing.insert(locate(key));
    }

    pub fn get_live(&self, key: &ObjectKey) -> Option<Value> {
        self.state.lock().unwrap().objects.get(&locate(key)).cloned()
    }

    /// Writes so far, as `"<verb> <name>"`
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().unwrap().operations.clone()
    }

    fn write(&self, verb: &str, key: &ObjectKey) -> Result<std::sync::MutexGuard<'_, ClusterState>, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&locate(key)) {
            return Err(ApiError::Api {
                code: 500,
                message: format!("injected failure for {}", key),
            });
        }
        state.operations.push(format!("{} {}", verb, key.name));
        Ok(state)
    }
}

/// Types the fake API server serves without a namespace
const CLUSTER_SCOPED: [(&str, &str); 4] = [
    ("v1", "Namespace"),
    ("rbac.authorization.k8s.io/v1", "ClusterRole"),
    ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding"),
    ("apiextensions.k8s.io/v1", "CustomResourceDefinition"),
];

fn is_cluster_scoped(api_version: &str, kind: &str) -> bool {
    CLUSTER_SCOPED.contains(&(api_version, kind))
}

/// Where the API server keeps `key`: cluster-scoped objects have no namespace
fn locate(key: &ObjectKey) -> ObjectKey {
    if is_cluster_scoped(&key.api_version, &key.kind) {
        ObjectKey {
            namespace: None,
            ..key.clone()
        }
    } else {
        key.clone()
    }
}

/// Drop the namespace of cluster-scoped objects, as the API server does
fn stored(key: &ObjectKey, mut object: Value) -> Value {
    if is_cluster_scoped(&key.api_version, &key.kind) {
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("namespace");
        }
    }
    object
}

fn labels_match(object: &Value, selector: &str) -> bool {
    selector.split(',').all(|requirement| match requirement.split_once('=') {
        Some((label, value)) => object
            .pointer("/metadata/labels")
            .and_then(|labels| labels.get(label))
            .and_then(Value::as_str)
            == Some(value),
        None => false,
    })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    fn cluster(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, ApiError> {
        self.get_live(key)
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ApiError::InvalidObject(e.to_string()))
    }

    async fn create(&self, key: &ObjectKey, object: &RedactedObject) -> Result<(), ApiError> {
        let mut state = self.write("create", key)?;
        state.objects.insert(locate(key), stored(key, object.to_value()));
        Ok(())
    }

    async fn update(&self, key: &ObjectKey, object: &RedactedObject) -> Result<(), ApiError> {
        let mut state = self.write("update", key)?;
        let mut updated = stored(key, object.to_value());
        if object.is_secret() {
            let existing = state.objects.get(&locate(key)).and_then(|o| o.get("data")).cloned();
            match (updated.as_object_mut(), existing) {
                (Some(fields), Some(data)) => {
                    fields.insert("data".to_string(), data);
                }
                (Some(fields), None) => {
                    fields.remove("data");
                }
                _ => {}
            }
        }
        state.objects.insert(locate(key), updated);
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ApiError> {
        let mut state = self.write("delete", key)?;
        state.objects.remove(&locate(key));
        Ok(())
    }

    async fn list_managed(
        &self,
        api_version: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>, ApiError> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|(key, object)| {
                key.api_version == api_version
                    && key.kind == kind
                    && labels_match(object, label_selector)
            })
            .map(|(_, object)| {
                serde_json::from_value(object.clone())
                    .map_err(|e| ApiError::InvalidObject(e.to_string()))
            })
            .collect()
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ApiError> {
        self.state
            .lock()
            .unwrap()
            .operations
            .push(format!("ensure {}", namespace));
        Ok(())
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, ApiError> {
        Ok(!is_cluster_scoped(api_version, kind))
    }
}

/// Connects to a fixed set of fake clusters; any other name is unreachable
#[derive(Clone)]
pub struct FakeConnector {
    clusters: HashMap<String, FakeCluster>,
}

impl FakeConnector {
    pub fn new(clusters: Vec<FakeCluster>) -> Self {
        Self {
            clusters: clusters
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn ClusterClient>, ApiError> {
        match self.clusters.get(cluster) {
            Some(fake) => Ok(Arc::new(fake.clone())),
            None => Err(ApiError::Unreachable {
                cluster: cluster.to_string(),
                reason: "no route to host".to_string(),
            }),
        }
    }
}

/// A Deployment of `registry.example.com/web-config:latest` in env `prod`
pub fn make_deployment_resource(
    namespace: &str,
    name: &str,
    footprint: &[(&str, u32)],
) -> DeclaredResource {
    DeclaredResource {
        resource: Resource::Deployment(DeploymentResource {
            api_version: "convoy.dev/v1".to_string(),
            metadata: ResourceMetadata {
                name: name.to_string(),
                ..Default::default()
            },
            config: DeploymentConfig {
                image: "registry.example.com/web-config:latest".to_string(),
                env: "prod".to_string(),
                variables: Default::default(),
                service: None,
            },
            footprint: footprint
                .iter()
                .map(|(cluster, replicas)| (cluster.to_string(), FootprintEntry { replicas: *replicas }))
                .collect(),
        }),
        namespace: Some(namespace.to_string()),
        source: PathBuf::from(format!("{}/index.yaml", namespace)),
    }
}

/// Raw YAML resource with a single `settings` ConfigMap
pub fn make_yaml_resource(namespace: &str, name: &str, clusters: &[&str]) -> DeclaredResource {
    let settings: DynamicObject = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": "settings"},
        "data": {"mode": "fast"},
    }))
    .unwrap();

    DeclaredResource {
        resource: Resource::KubernetesYaml(KubernetesYamlResource {
            api_version: "convoy.dev/v1".to_string(),
            metadata: ResourceMetadata {
                name: name.to_string(),
                ..Default::default()
            },
            clusters: clusters.iter().map(|c| c.to_string()).collect(),
            objects: vec![settings],
            sources: Vec::new(),
        }),
        namespace: Some(namespace.to_string()),
        source: PathBuf::from(format!("{}/index.yaml", namespace)),
    }
}
