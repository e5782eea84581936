// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
pub mod builder;
pub mod config;
pub mod constants;
pub mod declarations;
pub mod diff;
pub mod error;
pub mod evaluator;
pub mod kubernetes;
pub mod redaction;
pub mod registry;
pub mod store;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_utils;
