// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Domain types: object keys, declared resources, configuration definitions and variables.

pub mod definition;
pub mod key;
pub mod resource;
pub mod variable;

pub use key::{KeyFilter, ObjectKey};
pub use resource::{DeclaredResource, Resource, ResourceId};
