// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Plans: what has to change to get from the recorded state to the desired state.

use crate::builder::DesiredState;
use crate::error::Result;
use crate::redaction::RedactedObject;
use crate::store::{ObjectRecord, StateStore};
use crate::types::key::{KeyFilter, ObjectKey};
use similar::TextDiff;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, instrument};

#[derive(Clone, Debug, PartialEq)]
pub struct PlanEntry {
    pub key: ObjectKey,
    /// Resource that renders (or last rendered) the object
    pub owner: String,
    pub before: Option<RedactedObject>,
    pub after: Option<RedactedObject>,
    /// Apply as delete then create, the change touches an immutable field
    pub recreate: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Plan {
    pub creates: Vec<PlanEntry>,
    pub updates: Vec<PlanEntry>,
    pub deletes: Vec<PlanEntry>,
    pub unchanged: Vec<ObjectKey>,
    /// Recorded objects of resources that failed to build; left as they are
    pub skipped: Vec<ObjectKey>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    /// Mark the plan as approved for execution
    pub fn confirm(self, actor: &str) -> ConfirmedPlan {
        ConfirmedPlan {
            plan: self,
            actor: actor.to_string(),
        }
    }
}

/// A plan the operator agreed to; the only thing the apply executor accepts
#[derive(Debug)]
pub struct ConfirmedPlan {
    pub plan: Plan,
    pub actor: String,
}

/// Load the recorded state and diff the desired state against it
#[instrument(skip_all)]
pub async fn plan(desired: &DesiredState, store: &dyn StateStore, filter: &KeyFilter) -> Result<Plan> {
    let recorded = store.load().await?;
    let plan = diff(desired, &recorded, filter);
    info!(
        "Plan: {} to create, {} to update, {} to delete, {} unchanged, {} skipped",
        plan.creates.len(),
        plan.updates.len(),
        plan.deletes.len(),
        plan.unchanged.len(),
        plan.skipped.len()
    );
    Ok(plan)
}

/// Classify every key matching `filter`. Pure: nothing is read or written.
pub fn diff(
    desired: &DesiredState,
    recorded: &BTreeMap<ObjectKey, ObjectRecord>,
    filter: &KeyFilter,
) -> Plan {
    let mut plan = Plan::default();

    for (key, wanted) in desired.objects.iter().filter(|(k, _)| filter.matches(k)) {
        let existing = recorded.get(key);
        let entry = |after: Option<&RedactedObject>| PlanEntry {
            key: key.clone(),
            owner: wanted.owner.clone(),
            before: existing.map(|r| r.body.clone()),
            after: after.cloned(),
            recreate: false,
        };

        match (&wanted.object, existing) {
            (Some(body), None) => plan.creates.push(entry(Some(body))),
            (Some(body), Some(record)) if record.body == *body && record.owner == wanted.owner => {
                plan.unchanged.push(key.clone())
            }
            (Some(body), Some(record)) => {
                let mut update = entry(Some(body));
                update.recreate = needs_recreate(key, &record.body, body);
                plan.updates.push(update);
            }
            (None, Some(_)) => plan.deletes.push(entry(None)),
            (None, None) => {}
        }
    }

    for (key, record) in recorded.iter().filter(|(k, _)| filter.matches(k)) {
        if desired.objects.contains_key(key) {
            continue;
        }
        if desired.is_failed(&record.owner) {
            debug!("Keeping {}, {} failed to build", key, record.owner);
            plan.skipped.push(key.clone());
            continue;
        }
        plan.deletes.push(PlanEntry {
            key: key.clone(),
            owner: record.owner.clone(),
            before: Some(record.body.clone()),
            after: None,
            recreate: false,
        });
    }

    plan.deletes.sort_by(|a, b| a.key.cmp(&b.key));
    plan
}

/// Deployment selectors are immutable once created
fn needs_recreate(key: &ObjectKey, before: &RedactedObject, after: &RedactedObject) -> bool {
    key.api_version == "apps/v1"
        && key.kind == "Deployment"
        && before.object().data.pointer("/spec/selector")
            != after.object().data.pointer("/spec/selector")
}

fn render_yaml(object: Option<&RedactedObject>) -> String {
    object
        .map(|o| serde_yaml::to_string(&o.display_value()).unwrap_or_default())
        .unwrap_or_default()
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let before = render_yaml(self.before.as_ref());
        let after = render_yaml(self.after.as_ref());
        let diff = TextDiff::from_lines(&before, &after);
        write!(
            f,
            "{}",
            diff.unified_diff()
                .context_radius(3)
                .header("recorded", "desired")
        )
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "Nothing to do");
        }

        let sections = [
            ("delete", &self.deletes),
            ("create", &self.creates),
            ("update", &self.updates),
        ];
        for (action, entries) in sections {
            for entry in entries {
                let action = if entry.recreate { "recreate" } else { action };
                writeln!(f, "• {} {} [{}]", action, entry.key, entry.owner)?;
                writeln!(f, "{}", entry)?;
            }
        }

        writeln!(
            f,
            "{} to create, {} to update, {} to delete ({} unchanged, {} skipped)",
            self.creates.len(),
            self.updates.len(),
            self.deletes.len(),
            self.unchanged.len(),
            self.skipped.len()
        )
    }
}
