// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Evaluation of a configuration definition for one environment and one set of bindings.

use crate::error::ConfigError;
use crate::types::definition::{Argument, Branchable, ConfigDefinition, Declaration, Scalar};
use crate::types::variable::{
    Binding, Bindings, FileVariableRef, Port, PortDeclaration, SecretKeyRef, VariableKind,
    VariableRef,
};
use std::collections::BTreeMap;
use std::path::Path;

/// A slot value after branch selection and binding lookup
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResolvedValue {
    Literal(String),
    /// Secret-backed string; only the reference is known
    Secret {
        variable: String,
        reference: SecretKeyRef,
    },
    /// Secret-backed file mounted at `path`
    SecretFile {
        variable: String,
        reference: SecretKeyRef,
        path: String,
    },
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Quantities {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

impl Quantities {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Requirements {
    pub requests: Quantities,
    pub limits: Quantities,
}

/// Concrete container settings for one environment
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ApplicationDescriptor {
    pub args: Vec<ResolvedValue>,
    pub env: BTreeMap<String, ResolvedValue>,
    pub resources: Requirements,
    /// Ports in declaration order
    pub ports: Vec<Port>,
}

impl ApplicationDescriptor {
    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }
}

/// Evaluate `definition` for `environment`.
///
/// Fails on the first problem found; bindings are checked for unused entries before any slot is
/// evaluated so an extra binding is reported regardless of the environment.
pub fn evaluate(
    definition: &ConfigDefinition,
    environment: &str,
    bindings: &Bindings,
) -> Result<ApplicationDescriptor, ConfigError> {
    let referenced = definition.referenced_variables();
    if let Some(unused) = bindings.keys().find(|name| !referenced.contains(name.as_str())) {
        return Err(ConfigError::UnusedBinding(unused.clone()));
    }

    let mut evaluation = Evaluation {
        environment,
        bindings,
        descriptor: ApplicationDescriptor::default(),
    };

    for (index, slot) in definition.args.iter().enumerate() {
        if let Some(value) = evaluation.slot(slot, &format!("args[{}]", index))? {
            evaluation.descriptor.args.push(value);
        }
    }

    for (name, slot) in &definition.env {
        if let Some(value) = evaluation.slot(slot, &format!("env.{}", name))? {
            evaluation.descriptor.env.insert(name.clone(), value);
        }
    }

    let resources = &definition.resources;
    evaluation.descriptor.resources = Requirements {
        requests: Quantities {
            cpu: select_quantity(&resources.requests.cpu, environment, "resources.requests.cpu")?,
            memory: select_quantity(
                &resources.requests.memory,
                environment,
                "resources.requests.memory",
            )?,
        },
        limits: Quantities {
            cpu: select_quantity(&resources.limits.cpu, environment, "resources.limits.cpu")?,
            memory: select_quantity(
                &resources.limits.memory,
                environment,
                "resources.limits.memory",
            )?,
        },
    };

    Ok(evaluation.descriptor)
}

fn select_quantity(
    slot: &Option<Branchable<Scalar>>,
    environment: &str,
    name: &str,
) -> Result<Option<String>, ConfigError> {
    match slot {
        Some(slot) => Ok(slot.select(environment, name)?.map(Scalar::to_string)),
        None => Ok(None),
    }
}

struct Evaluation<'a> {
    environment: &'a str,
    bindings: &'a Bindings,
    descriptor: ApplicationDescriptor,
}

impl Evaluation<'_> {
    fn slot(
        &mut self,
        slot: &Branchable<Argument>,
        name: &str,
    ) -> Result<Option<ResolvedValue>, ConfigError> {
        let Some(argument) = slot.select(self.environment, name)? else {
            return Ok(None);
        };
        let resolved = match argument {
            Argument::Literal(scalar) => ResolvedValue::Literal(scalar.to_string()),
            Argument::Declared(Declaration::Port(port)) => self.port(port)?,
            Argument::Declared(Declaration::String(variable)) => self.plain_string(variable)?,
            Argument::Declared(Declaration::SecretString(variable)) => ResolvedValue::Secret {
                variable: variable.name.clone(),
                reference: self.secret(&variable.name, VariableKind::SecretString)?,
            },
            Argument::Declared(Declaration::SecretFile(variable)) => self.secret_file(variable)?,
        };
        Ok(Some(resolved))
    }

    fn port(&mut self, declared: &PortDeclaration) -> Result<ResolvedValue, ConfigError> {
        let number = u16::try_from(declared.number)
            .ok()
            .filter(|n| *n != 0)
            .ok_or_else(|| ConfigError::InvalidPort {
                name: declared.name.clone(),
                number: declared.number,
            })?;

        if self.descriptor.port(&declared.name).is_some() {
            return Err(ConfigError::DuplicatePort(declared.name.clone()));
        }

        self.descriptor.ports.push(Port {
            name: declared.name.clone(),
            number,
            protocol: declared.protocol,
        });
        Ok(ResolvedValue::Literal(number.to_string()))
    }

    fn binding(&self, name: &str) -> Result<&Binding, ConfigError> {
        self.bindings
            .get(name)
            .ok_or_else(|| ConfigError::UnboundVariable(name.to_string()))
    }

    fn plain_string(&self, variable: &VariableRef) -> Result<ResolvedValue, ConfigError> {
        match self.binding(&variable.name)? {
            Binding::Value(value) => Ok(ResolvedValue::Literal(value.clone())),
            other => Err(mismatch(&variable.name, VariableKind::PlainString, other)),
        }
    }

    fn secret(&self, name: &str, kind: VariableKind) -> Result<SecretKeyRef, ConfigError> {
        match self.binding(name)? {
            Binding::SecretKeyRef(reference) => Ok(reference.clone()),
            other => Err(mismatch(name, kind, other)),
        }
    }

    fn secret_file(&self, variable: &FileVariableRef) -> Result<ResolvedValue, ConfigError> {
        let path = Path::new(&variable.path);
        if !path.is_absolute() || path.file_name().is_none() {
            return Err(ConfigError::Malformed(format!(
                "secret file '{}' needs an absolute file path, got '{}'",
                variable.name, variable.path
            )));
        }

        Ok(ResolvedValue::SecretFile {
            variable: variable.name.clone(),
            reference: self.secret(&variable.name, VariableKind::SecretFile)?,
            path: variable.path.clone(),
        })
    }
}

fn mismatch(variable: &str, expected: VariableKind, actual: &Binding) -> ConfigError {
    ConfigError::BindingKindMismatch {
        variable: variable.to_string(),
        expected: expected.describe(),
        actual: actual.describe(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::variable::Protocol;

    const DEFINITION: &str = r#"
args:
  - --listen
  - port: {name: http, number: 8080}
  - branch: {dev: --verbose, prod: null}
  - string: {name: region}
env:
  API_TOKEN: {secretString: {name: api-token}}
  TLS_CERT: {secretFile: {name: tls-cert, path: /etc/tls/cert.pem}}
resources:
  requests: {cpu: {branch: {dev: 100m, prod: "1"}}, memory: 256Mi}
  limits: {memory: 1Gi}
"#;

    fn make_definition(raw: &str) -> ConfigDefinition {
        ConfigDefinition::from_yaml(raw).unwrap()
    }

    fn secret_ref(name: &str, key: &str) -> SecretKeyRef {
        SecretKeyRef {
            name: name.to_string(),
            key: key.to_string(),
        }
    }

    fn make_bindings() -> Bindings {
        Bindings::from([
            (
                "api-token".to_string(),
                Binding::SecretKeyRef(secret_ref("web", "token")),
            ),
            (
                "tls-cert".to_string(),
                Binding::SecretKeyRef(secret_ref("web-tls", "cert")),
            ),
            (
                "region".to_string(),
                Binding::Value("us-east-1".to_string()),
            ),
        ])
    }

    #[test]
    fn test_evaluate_prod() {
        let descriptor = evaluate(&make_definition(DEFINITION), "prod", &make_bindings()).unwrap();

        assert_eq!(
            descriptor.args,
            vec![
                ResolvedValue::Literal("--listen".to_string()),
                ResolvedValue::Literal("8080".to_string()),
                ResolvedValue::Literal("us-east-1".to_string()),
            ]
        );
        assert_eq!(
            descriptor.env.get("API_TOKEN"),
            Some(&ResolvedValue::Secret {
                variable: "api-token".to_string(),
                reference: secret_ref("web", "token"),
            })
        );
        assert_eq!(
            descriptor.env.get("TLS_CERT"),
            Some(&ResolvedValue::SecretFile {
                variable: "tls-cert".to_string(),
                reference: secret_ref("web-tls", "cert"),
                path: "/etc/tls/cert.pem".to_string(),
            })
        );
        assert_eq!(descriptor.resources.requests.cpu.as_deref(), Some("1"));
        assert_eq!(descriptor.resources.requests.memory.as_deref(), Some("256Mi"));
        assert_eq!(descriptor.resources.limits.cpu, None);
        assert_eq!(
            descriptor.ports,
            vec![Port {
                name: "http".to_string(),
                number: 8080,
                protocol: Protocol::TCP,
            }]
        );
    }

    #[test]
    fn test_evaluate_dev_includes_branch() {
        let descriptor = evaluate(&make_definition(DEFINITION), "dev", &make_bindings()).unwrap();

        assert_eq!(descriptor.args.len(), 4);
        assert_eq!(descriptor.args[2], ResolvedValue::Literal("--verbose".to_string()));
        assert_eq!(descriptor.resources.requests.cpu.as_deref(), Some("100m"));
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let definition = make_definition(DEFINITION);
        let bindings = make_bindings();
        assert_eq!(
            evaluate(&definition, "prod", &bindings).unwrap(),
            evaluate(&definition, "prod", &bindings).unwrap()
        );
    }

    #[test]
    fn test_missing_environment_branch() {
        let err = evaluate(&make_definition(DEFINITION), "staging", &make_bindings()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingEnvironmentBranch {
                environment: "staging".to_string(),
                slot: "args[2]".to_string(),
            }
        );
    }

    #[test]
    fn test_unused_binding() {
        let mut bindings = make_bindings();
        bindings.insert(
            "unused-secret".to_string(),
            Binding::SecretKeyRef(secret_ref("web", "other")),
        );

        let err = evaluate(&make_definition(DEFINITION), "prod", &bindings).unwrap_err();
        assert_eq!(err, ConfigError::UnusedBinding("unused-secret".to_string()));
    }

    #[test]
    fn test_binding_used_only_in_other_environment_is_not_unused() {
        let definition = make_definition("args:\n  - branch: {dev: {string: {name: debug}}, prod: null}\n");
        let bindings = Bindings::from([("debug".to_string(), Binding::Value("1".to_string()))]);

        let descriptor = evaluate(&definition, "prod", &bindings).unwrap();
        assert!(descriptor.args.is_empty());
    }

    #[test]
    fn test_unbound_variable() {
        let mut bindings = make_bindings();
        bindings.remove("region");

        let err = evaluate(&make_definition(DEFINITION), "prod", &bindings).unwrap_err();
        assert_eq!(err, ConfigError::UnboundVariable("region".to_string()));
    }

    #[test]
    fn test_secret_bound_to_literal_is_rejected() {
        let mut bindings = make_bindings();
        bindings.insert("api-token".to_string(), Binding::Value("hunter2".to_string()));

        let err = evaluate(&make_definition(DEFINITION), "prod", &bindings).unwrap_err();
        assert_eq!(
            err,
            ConfigError::BindingKindMismatch {
                variable: "api-token".to_string(),
                expected: "secret string",
                actual: "a literal value",
            }
        );
    }

    #[test]
    fn test_invalid_port_number() {
        let definition = make_definition("args:\n  - port: {name: http, number: 70000}\n");
        let err = evaluate(&definition, "prod", &Bindings::new()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidPort {
                name: "http".to_string(),
                number: 70000,
            }
        );
    }

    #[test]
    fn test_port_zero_is_invalid() {
        let definition = make_definition("args:\n  - port: {name: http, number: 0}\n");
        let err = evaluate(&definition, "prod", &Bindings::new()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { number: 0, .. }));
    }

    #[test]
    fn test_duplicate_port() {
        let definition = make_definition(
            "args:\n  - port: {name: http, number: 8080}\nenv:\n  PORT: {port: {name: http, number: 8081}}\n",
        );
        let err = evaluate(&definition, "prod", &Bindings::new()).unwrap_err();
        assert_eq!(err, ConfigError::DuplicatePort("http".to_string()));
    }

    #[test]
    fn test_relative_secret_file_path() {
        let definition =
            make_definition("env:\n  CERT: {secretFile: {name: cert, path: cert.pem}}\n");
        let bindings = Bindings::from([(
            "cert".to_string(),
            Binding::SecretKeyRef(secret_ref("tls", "cert")),
        )]);

        let err = evaluate(&definition, "prod", &bindings).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }
}
