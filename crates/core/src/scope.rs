//! Which kinds are cluster-scoped.
//!
//! Generators and steps run without discovery, so scope comes from a static
//! table: common built-in cluster-scoped kinds plus whatever the caller adds.

use rustc_hash::FxHashSet;

use crate::ResourceKind;

/// Built-in cluster-scoped kinds as `(group, kind)`.
const BUILTIN_CLUSTER_SCOPED: &[(&str, &str)] = &[
    ("", "Namespace"),
    ("", "Node"),
    ("", "PersistentVolume"),
    ("rbac.authorization.k8s.io", "ClusterRole"),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
    ("apiextensions.k8s.io", "CustomResourceDefinition"),
    ("storage.k8s.io", "StorageClass"),
    ("storage.k8s.io", "CSIDriver"),
    ("scheduling.k8s.io", "PriorityClass"),
    ("networking.k8s.io", "IngressClass"),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration"),
    ("apiregistration.k8s.io", "APIService"),
];

#[derive(Debug, Clone)]
pub struct ScopeTable {
    cluster_scoped: FxHashSet<(String, String)>,
}

impl Default for ScopeTable {
    fn default() -> Self {
        let cluster_scoped = BUILTIN_CLUSTER_SCOPED.iter().map(|(g, k)| (g.to_string(), k.to_string())).collect();
        Self { cluster_scoped }
    }
}

impl ScopeTable {
    /// Table with no cluster-scoped kinds at all.
    pub fn empty() -> Self {
        Self { cluster_scoped: FxHashSet::default() }
    }

    pub fn with_cluster_scoped(mut self, group: &str, kind: &str) -> Self {
        self.cluster_scoped.insert((group.to_string(), kind.to_string()));
        self
    }

    /// Add every kind in `kinds`; their versions are ignored.
    pub fn with_kinds<'a>(mut self, kinds: impl IntoIterator<Item = &'a ResourceKind>) -> Self {
        for k in kinds {
            self.cluster_scoped.insert((k.group.clone(), k.kind.clone()));
        }
        self
    }

    /// Version is ignored: scope does not change between versions of a kind.
    pub fn is_cluster_scoped(&self, kind: &ResourceKind) -> bool {
        self.cluster_scoped.contains(&(kind.group.clone(), kind.kind.clone()))
    }
}
