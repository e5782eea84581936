// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Declared indirections a configuration may reference, and the operator bindings they resolve to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Operator-supplied bindings, keyed by variable name
pub type Bindings = BTreeMap<String, Binding>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Protocol {
    #[default]
    TCP,
    UDP,
    SCTP,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::TCP => write!(f, "TCP"),
            Protocol::UDP => write!(f, "UDP"),
            Protocol::SCTP => write!(f, "SCTP"),
        }
    }
}

/// A named network port as declared; the number is validated during evaluation
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortDeclaration {
    pub name: String,
    pub number: u32,
    #[serde(default)]
    pub protocol: Protocol,
}

/// A validated port exposed by an application
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Port {
    pub name: String,
    pub number: u16,
    pub protocol: Protocol,
}

/// Reference to a plain or secret string variable
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VariableRef {
    pub name: String,
}

/// Reference to a secret mounted as a file at `path`
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileVariableRef {
    pub name: String,
    pub path: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VariableKind {
    PlainString,
    SecretString,
    SecretFile,
}

impl VariableKind {
    pub fn describe(&self) -> &'static str {
        match self {
            VariableKind::PlainString => "plain string",
            VariableKind::SecretString => "secret string",
            VariableKind::SecretFile => "secret file",
        }
    }
}

/// Identity of a key inside an operator-managed Kubernetes Secret.
///
/// This is a reference, never content: two refs are equal when they point at the same key.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

impl fmt::Display for SecretKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "secret {}/{}", self.name, self.key)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "BindingDocument")]
pub enum Binding {
    /// Literal value for a plain string variable
    Value(String),
    SecretKeyRef(SecretKeyRef),
}

/// `{value: ...}` or `{secretKeyRef: {name, key}}` as written in a declaration
#[derive(Deserialize)]
#[serde(untagged)]
enum BindingDocument {
    Value(ValueBinding),
    SecretKeyRef(SecretKeyRefBinding),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ValueBinding {
    value: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct SecretKeyRefBinding {
    secret_key_ref: SecretKeyRef,
}

impl From<BindingDocument> for Binding {
    fn from(document: BindingDocument) -> Self {
        match document {
            BindingDocument::Value(binding) => Binding::Value(binding.value),
            BindingDocument::SecretKeyRef(binding) => Binding::SecretKeyRef(binding.secret_key_ref),
        }
    }
}

impl Binding {
    pub fn describe(&self) -> &'static str {
        match self {
            Binding::Value(_) => "a literal value",
            Binding::SecretKeyRef(_) => "a secret reference",
        }
    }
}
