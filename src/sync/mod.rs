// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Moving state between the store and the clusters.

pub mod apply;
pub mod import;
pub mod refresh;

pub use apply::{ApplyExecutor, ApplyReport};
pub use import::{ImportFlow, ImportPreview};
pub use refresh::{RefreshFlow, RefreshReport};
