// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Rendering of an evaluated application into a Deployment and its Service

use super::Stamp;
use crate::constants::{labels, secrets::ARG_ENV_PREFIX};
use crate::error::ConfigError;
use crate::evaluator::{ApplicationDescriptor, Quantities, ResolvedValue};
use crate::registry::ConfigImage;
use crate::types::resource::{ResourceMetadata, ServiceConfig};
use crate::types::variable::SecretKeyRef;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, KeyToPath, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretKeySelector, SecretVolumeSource, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use std::path::Path;

/// Deployment without replica count, plus the Service when ports are exposed
pub(crate) struct DeploymentTemplate {
    pub deployment: Deployment,
    pub service: Option<Service>,
}

impl DeploymentTemplate {
    pub fn with_replicas(&self, replicas: u32) -> Deployment {
        let mut deployment = self.deployment.clone();
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(i32::try_from(replicas).unwrap_or(i32::MAX));
        }
        deployment
    }
}

pub(crate) fn render_deployment(
    metadata: &ResourceMetadata,
    namespace: &str,
    image: &ConfigImage,
    descriptor: &ApplicationDescriptor,
    service: Option<&ServiceConfig>,
    stamp: &Stamp,
) -> Result<DeploymentTemplate, ConfigError> {
    let name = &metadata.name;
    let selector = BTreeMap::from([(stamp.key(labels::APP), name.clone())]);

    let mut object_labels = metadata.labels.clone();
    object_labels.extend(selector.clone());

    let mut object_meta = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace.to_string()),
        labels: Some(object_labels.clone()),
        annotations: Some(metadata.annotations.clone()),
        ..Default::default()
    };
    stamp.apply(&mut object_meta);
    object_meta
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(stamp.key(labels::CONFIG_IMAGE), image.config.to_string());

    let (container, volumes) = render_container(name, image, descriptor);

    let deployment = Deployment {
        metadata: object_meta.clone(),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            progress_deadline_seconds: Some(600),
            revision_history_limit: Some(10),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_surge: Some(IntOrString::String("25%".to_string())),
                    max_unavailable: Some(IntOrString::String("25%".to_string())),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(object_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    };

    let service = render_service(object_meta, selector, descriptor, service)?;
    Ok(DeploymentTemplate {
        deployment,
        service,
    })
}

fn render_container(
    name: &str,
    image: &ConfigImage,
    descriptor: &ApplicationDescriptor,
) -> (Container, Vec<Volume>) {
    let mut mounts = SecretMounts::default();
    let mut env = Vec::new();

    for (variable, value) in &descriptor.env {
        let var = match value {
            ResolvedValue::Literal(value) => EnvVar {
                name: variable.clone(),
                value: Some(value.clone()),
                ..Default::default()
            },
            ResolvedValue::Secret { reference, .. } => secret_env(variable, reference),
            ResolvedValue::SecretFile {
                variable: secret,
                reference,
                path,
            } => {
                mounts.add(secret, reference, path);
                EnvVar {
                    name: variable.clone(),
                    value: Some(path.clone()),
                    ..Default::default()
                }
            }
        };
        env.push(var);
    }

    // Secret strings in args go through an env var and $(VAR) expansion
    let mut args = Vec::new();
    for value in &descriptor.args {
        match value {
            ResolvedValue::Literal(value) => args.push(value.clone()),
            ResolvedValue::Secret {
                variable,
                reference,
            } => {
                let env_name = secret_env_name(variable);
                if !env.iter().any(|e| e.name == env_name) {
                    env.push(secret_env(&env_name, reference));
                }
                args.push(format!("$({})", env_name));
            }
            ResolvedValue::SecretFile {
                variable,
                reference,
                path,
            } => {
                mounts.add(variable, reference, path);
                args.push(path.clone());
            }
        }
    }

    let ports: Vec<ContainerPort> = descriptor
        .ports
        .iter()
        .map(|port| ContainerPort {
            name: Some(port.name.clone()),
            container_port: i32::from(port.number),
            protocol: Some(port.protocol.to_string()),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: name.to_string(),
        image: Some(format!(
            "{}/{}@{}",
            image.binary.registry, image.binary.repository, image.binary.digest
        )),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: (!args.is_empty()).then_some(args),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        resources: render_resources(descriptor),
        volume_mounts: (!mounts.mounts.is_empty()).then_some(mounts.mounts),
        ..Default::default()
    };
    (container, mounts.volumes)
}

fn secret_env(name: &str, reference: &SecretKeyRef) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: reference.name.clone(),
                key: reference.key.clone(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

pub(crate) fn secret_env_name(variable: &str) -> String {
    let suffix: String = variable
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", ARG_ENV_PREFIX, suffix)
}

fn render_resources(descriptor: &ApplicationDescriptor) -> Option<ResourceRequirements> {
    fn quantities(q: &Quantities) -> Option<BTreeMap<String, Quantity>> {
        let map: BTreeMap<String, Quantity> = [("cpu", &q.cpu), ("memory", &q.memory)]
            .into_iter()
            .filter_map(|(name, value)| {
                value
                    .as_ref()
                    .map(|v| (name.to_string(), Quantity(v.clone())))
            })
            .collect();
        (!map.is_empty()).then_some(map)
    }

    let resources = &descriptor.resources;
    if resources.requests.is_empty() && resources.limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..Default::default()
    })
}

/// Secret volumes, one per Secret, mounted read-only at each file's directory
#[derive(Default)]
struct SecretMounts {
    volumes: Vec<Volume>,
    mounts: Vec<VolumeMount>,
}

impl SecretMounts {
    fn add(&mut self, variable: &str, reference: &SecretKeyRef, path: &str) {
        let path = Path::new(path);
        let directory = path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "/".to_string());
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| variable.to_string());

        let volume_name = format!("secret-{}", reference.name);
        let index = match self.volumes.iter().position(|v| v.name == volume_name) {
            Some(index) => index,
            None => {
                self.volumes.push(Volume {
                    name: volume_name.clone(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(reference.name.clone()),
                        items: Some(Vec::new()),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                self.volumes.len() - 1
            }
        };

        if let Some(items) = self.volumes[index]
            .secret
            .as_mut()
            .and_then(|s| s.items.as_mut())
        {
            let exists = items
                .iter()
                .any(|i| i.key == reference.key && i.path == file_name);
            if !exists {
                items.push(KeyToPath {
                    key: reference.key.clone(),
                    path: file_name,
                    mode: None,
                });
            }
        }

        let mounted = self
            .mounts
            .iter()
            .any(|m| m.name == volume_name && m.mount_path == directory);
        if !mounted {
            self.mounts.push(VolumeMount {
                name: volume_name,
                mount_path: directory,
                read_only: Some(true),
                ..Default::default()
            });
        }
    }
}

fn render_service(
    metadata: ObjectMeta,
    selector: BTreeMap<String, String>,
    descriptor: &ApplicationDescriptor,
    config: Option<&ServiceConfig>,
) -> Result<Option<Service>, ConfigError> {
    let ports: Vec<ServicePort> = match config {
        Some(config) => config
            .ports
            .iter()
            .map(|(target, mapping)| {
                let port = descriptor
                    .port(target)
                    .ok_or_else(|| ConfigError::UnknownServicePort(target.clone()))?;
                Ok(ServicePort {
                    name: Some(mapping.name.clone().unwrap_or_else(|| target.clone())),
                    port: mapping.number,
                    protocol: Some(port.protocol.to_string()),
                    target_port: Some(IntOrString::String(target.clone())),
                    ..Default::default()
                })
            })
            .collect::<Result<_, ConfigError>>()?,
        None => descriptor
            .ports
            .iter()
            .map(|port| ServicePort {
                name: Some(port.name.clone()),
                port: i32::from(port.number),
                protocol: Some(port.protocol.to_string()),
                target_port: Some(IntOrString::String(port.name.clone())),
                ..Default::default()
            })
            .collect(),
    };

    if ports.is_empty() {
        return Ok(None);
    }
    Ok(Some(Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }))
}
