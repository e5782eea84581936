// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! OCI distribution API client over HTTP(S)

use super::{Digest, ImageReference, RegistryClient, DOCKER_MANIFEST, OCI_MANIFEST};
use crate::error::RegistryError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use url::Url;

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";

pub struct HttpRegistryClient {
    client: reqwest::Client,
    insecure: Vec<String>,
    credentials: Option<(String, String)>,
    /// Bearer tokens per `registry/repository`
    tokens: RwLock<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl HttpRegistryClient {
    pub fn new(insecure: Vec<String>, credentials: Option<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            insecure,
            credentials,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    fn base_url(&self, registry: &str) -> String {
        let host = if registry == DOCKER_HUB {
            DOCKER_HUB_API
        } else {
            registry
        };
        let scheme = if self.insecure.iter().any(|r| r == registry) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, host)
    }

    async fn send(
        &self,
        method: Method,
        image: &ImageReference,
        path: &str,
    ) -> Result<Response, RegistryError> {
        let url = format!("{}/v2/{}/{}", self.base_url(&image.registry), image.repository, path);
        let cache_key = image.name();

        let token = self.tokens.read().await.get(&cache_key).cloned();
        let response = self
            .request(method.clone(), &url, token.as_deref())
            .send()
            .await
            .map_err(|e| unreachable(image, e))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(image, response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();

        let retry = if let Some(params) = challenge.strip_prefix("Bearer ") {
            let token = self.fetch_token(image, params).await?;
            self.tokens.write().await.insert(cache_key, token.clone());
            self.request(method, &url, Some(&token))
        } else if let Some((user, password)) = &self.credentials {
            self.request(method, &url, None)
                .basic_auth(user, Some(password))
        } else {
            return Err(RegistryError::NotFound {
                reference: image.to_string(),
            });
        };

        let response = retry.send().await.map_err(|e| unreachable(image, e))?;
        check_status(image, response)
    }

    fn request(&self, method: Method, url: &str, token: Option<&str>) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, format!("{}, {}", OCI_MANIFEST, DOCKER_MANIFEST));
        match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    #[instrument(skip(self, params), fields(image = %image))]
    async fn fetch_token(&self, image: &ImageReference, params: &str) -> Result<String, RegistryError> {
        let params = parse_challenge(params);
        let realm = params.get("realm").ok_or_else(|| RegistryError::Unreachable {
            reference: image.to_string(),
            reason: "authentication challenge without realm".to_string(),
        })?;

        let mut url = Url::parse(realm).map_err(|e| RegistryError::Unreachable {
            reference: image.to_string(),
            reason: format!("invalid token realm '{}': {}", realm, e),
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = params.get("service") {
                query.append_pair("service", service);
            }
            match params.get("scope") {
                Some(scope) => query.append_pair("scope", scope),
                None => query.append_pair("scope", &format!("repository:{}:pull", image.repository)),
            };
        }

        let mut request = self.client.get(url);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        debug!("Requesting registry token from {}", realm);
        let response = request.send().await.map_err(|e| unreachable(image, e))?;
        let response = check_status(image, response)?;
        let token: TokenResponse = response.json().await.map_err(|e| unreachable(image, e))?;

        token
            .token
            .or(token.access_token)
            .ok_or_else(|| RegistryError::Unreachable {
                reference: image.to_string(),
                reason: "token endpoint returned no token".to_string(),
            })
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    #[instrument(skip(self), fields(image = %image))]
    async fn resolve_digest(&self, image: &ImageReference) -> Result<Digest, RegistryError> {
        let path = format!("manifests/{}", image.manifest_reference());
        let response = self.send(Method::HEAD, image, &path).await?;

        if let Some(digest) = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
        {
            return digest.parse();
        }

        // Some registries omit the header on HEAD; hash the manifest instead
        let response = self.send(Method::GET, image, &path).await?;
        let body = response.bytes().await.map_err(|e| unreachable(image, e))?;
        Ok(Digest::of(&body))
    }

    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        digest: &Digest,
    ) -> Result<Bytes, RegistryError> {
        let response = self
            .send(Method::GET, image, &format!("manifests/{}", digest))
            .await?;
        response.bytes().await.map_err(|e| unreachable(image, e))
    }

    async fn fetch_blob(
        &self,
        image: &ImageReference,
        digest: &Digest,
    ) -> Result<Bytes, RegistryError> {
        let response = self
            .send(Method::GET, image, &format!("blobs/{}", digest))
            .await?;
        response.bytes().await.map_err(|e| unreachable(image, e))
    }
}

fn unreachable(image: &ImageReference, err: reqwest::Error) -> RegistryError {
    RegistryError::Unreachable {
        reference: image.to_string(),
        reason: err.to_string(),
    }
}

fn check_status(image: &ImageReference, response: Response) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(RegistryError::NotFound {
                reference: image.to_string(),
            })
        }
        _ => Err(RegistryError::Unreachable {
            reference: image.to_string(),
            reason: format!("HTTP {}", status),
        }),
    }
}

/// Parse `key="value",key="value"` authentication parameters
fn parse_challenge(params: &str) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    let mut rest = params.trim();
    while let Some((key, after)) = rest.split_once('=') {
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.split_once('"') {
                Some((value, remaining)) => (value, remaining),
                None => (quoted, ""),
            },
            None => match after.split_once(',') {
                Some((value, remaining)) => (value, remaining),
                None => (after, ""),
            },
        };
        result.insert(key, value.to_string());
        rest = remaining.trim_start_matches(',').trim_start();
    }
    result
}
