// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use std::fmt;

/// Natural key of a Kubernetes object on one cluster.
///
/// Field order matters: keys sort by cluster first so per-cluster batches stay contiguous.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKey {
    pub cluster: String,
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        cluster: impl Into<String>,
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.into(),
        }
    }

    /// Namespace column value; unnamespaced objects use the empty string
    pub fn store_namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }

    pub fn is_secret(&self) -> bool {
        self.api_version == "v1" && self.kind == "Secret"
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(
                f,
                "{} {}/{} ({})",
                self.kind, namespace, self.name, self.cluster
            ),
            None => write!(f, "{} {} ({})", self.kind, self.name, self.cluster),
        }
    }
}

/// Restricts an operation to the keys matching every field that is set
#[derive(Clone, Debug, Default)]
pub struct KeyFilter {
    pub api_version: Option<String>,
    pub cluster: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub namespace: Option<String>,
}

impl KeyFilter {
    pub fn matches(&self, key: &ObjectKey) -> bool {
        fn field_matches(filter: &Option<String>, value: &str) -> bool {
            filter.as_deref().map_or(true, |f| f == value)
        }

        field_matches(&self.api_version, &key.api_version)
            && field_matches(&self.cluster, &key.cluster)
            && field_matches(&self.kind, &key.kind)
            && field_matches(&self.name, &key.name)
            && (self.namespace.is_none() || key.namespace == self.namespace)
    }

    pub fn matches_cluster(&self, cluster: &str) -> bool {
        self.cluster.as_deref().map_or(true, |c| c == cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_key(namespace: Option<&str>) -> ObjectKey {
        ObjectKey::new("prod", "v1", "Pod", namespace, "my-pod")
    }

    #[test]
    fn test_display_namespaced() {
        assert_eq!(make_key(Some("default")).to_string(), "Pod default/my-pod (prod)");
    }

    #[test]
    fn test_display_cluster_scoped() {
        assert_eq!(make_key(None).to_string(), "Pod my-pod (prod)");
    }

    #[test]
    fn test_empty_namespace_is_unnamespaced() {
        let key = make_key(Some(""));
        assert_eq!(key.namespace, None);
        assert_eq!(key.store_namespace(), "");
    }

    #[test]
    fn test_keys_sort_by_cluster_first() {
        let a = ObjectKey::new("a", "v1", "Service", Some("z"), "z");
        let b = ObjectKey::new("b", "apps/v1", "Deployment", Some("a"), "a");
        assert!(a < b);
    }

    #[test]
    fn test_filter_empty_matches_everything() {
        assert!(KeyFilter::default().matches(&make_key(Some("default"))));
        assert!(KeyFilter::default().matches(&make_key(None)));
    }

    #[test]
    fn test_filter_api_version_mismatch() {
        let filter = KeyFilter {
            api_version: Some("apps/v1".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&make_key(Some("default"))));
    }

    #[test]
    fn test_filter_cluster_mismatch() {
        let filter = KeyFilter {
            cluster: Some("dev".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&make_key(Some("default"))));
        assert!(!filter.matches_cluster("prod"));
        assert!(filter.matches_cluster("dev"));
    }

    #[test]
    fn test_filter_namespace_mismatch() {
        let filter = KeyFilter {
            namespace: Some("production".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&make_key(Some("default"))));
        assert!(!filter.matches(&make_key(None)));
    }

    #[test]
    fn test_filter_partial_match() {
        let filter = KeyFilter {
            api_version: Some("v1".to_string()),
            cluster: Some("prod".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&make_key(Some("default"))));
    }
}
