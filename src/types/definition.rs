// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The configuration definition shipped inside a config image.
//!
//! A definition is plain data: every slot is either fixed or a branch map keyed by environment
//! name, and evaluating it is a lookup, never execution.

use crate::error::ConfigError;
use crate::types::variable::{FileVariableRef, PortDeclaration, VariableRef};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A slot that is either the same in every environment or selected per environment.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Branchable<T> {
    Branched(Branch<T>),
    Fixed(T),
}

/// Per-environment values; `None` omits the slot in that environment
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Branch<T> {
    pub branch: BTreeMap<String, Option<T>>,
}

impl<T> Branchable<T> {
    /// Select the value for `environment`. `Ok(None)` means the slot is omitted.
    pub fn select(&self, environment: &str, slot: &str) -> Result<Option<&T>, ConfigError> {
        match self {
            Branchable::Fixed(value) => Ok(Some(value)),
            Branchable::Branched(branch) => match branch.branch.get(environment) {
                Some(value) => Ok(value.as_ref()),
                None => Err(ConfigError::MissingEnvironmentBranch {
                    environment: environment.to_string(),
                    slot: slot.to_string(),
                }),
            },
        }
    }

    /// Every value across all branches, used for reference checks
    pub fn all_values(&self) -> Vec<&T> {
        match self {
            Branchable::Fixed(value) => vec![value],
            Branchable::Branched(branch) => branch.branch.values().flatten().collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{}", v),
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::String(v) => write!(f, "{}", v),
        }
    }
}

/// A variable declaration used in place of a literal
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Declaration {
    Port(PortDeclaration),
    String(VariableRef),
    SecretString(VariableRef),
    SecretFile(FileVariableRef),
}

impl Declaration {
    /// Name of the operator binding this declaration needs, if any
    pub fn binding_name(&self) -> Option<&str> {
        match self {
            Declaration::Port(_) => None,
            Declaration::String(v) | Declaration::SecretString(v) => Some(&v.name),
            Declaration::SecretFile(v) => Some(&v.name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Declared(Declaration),
    Literal(Scalar),
}

/// One requirement set (`requests` or `limits`), each field independently optional
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceQuantities {
    pub cpu: Option<Branchable<Scalar>>,
    pub memory: Option<Branchable<Scalar>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceSpec {
    pub requests: ResourceQuantities,
    pub limits: ResourceQuantities,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigDefinition {
    pub args: Vec<Branchable<Argument>>,
    pub env: BTreeMap<String, Branchable<Argument>>,
    pub resources: ResourceSpec,
}

impl ConfigDefinition {
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    /// Names of all variables referenced in any environment branch
    pub fn referenced_variables(&self) -> BTreeSet<&str> {
        self.args
            .iter()
            .chain(self.env.values())
            .flat_map(|slot| slot.all_values())
            .filter_map(|arg| match arg {
                Argument::Declared(declaration) => declaration.binding_name(),
                Argument::Literal(_) => None,
            })
            .collect()
    }
}
