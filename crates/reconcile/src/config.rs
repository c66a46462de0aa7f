//! Reconciler settings, read from `BROOD_*` environment variables.

use std::time::Duration;

use brood_core::{ResourceKind, ScopeTable};
use brood_prune::{DeleteContext, Propagation};
use tracing::{debug, warn};

const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Run the cleanup stage after a successful apply.
    pub prune: bool,
    pub delete: DeleteContext,
    /// Kinds always listed when looking for orphans, on top of the kinds the
    /// current desired set contains. Needed to clean up a kind the parent
    /// stopped producing altogether.
    pub child_kinds: Vec<ResourceKind>,
    /// Cluster-scoped kinds the built-in scope table does not know, such as
    /// cluster-scoped custom resources.
    pub cluster_scoped: Vec<ResourceKind>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            prune: true,
            delete: DeleteContext { timeout: Some(Duration::from_secs(DEFAULT_DELETE_TIMEOUT_SECS)), ..Default::default() },
            child_kinds: Vec::new(),
            cluster_scoped: Vec::new(),
        }
    }
}

fn flag(v: Option<String>) -> bool {
    v.map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`ReconcilerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        cfg.prune = !flag(get("BROOD_DISABLE_PRUNE"));
        cfg.delete.dry_run = flag(get("BROOD_DRY_RUN"));
        if let Some(secs) = get("BROOD_DELETE_TIMEOUT_SECS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.delete.timeout = if secs == 0 { None } else { Some(Duration::from_secs(secs)) };
        }
        if let Some(p) = get("BROOD_DELETE_PROPAGATION") {
            cfg.delete.propagation = match p.to_ascii_lowercase().as_str() {
                "foreground" => Propagation::Foreground,
                "orphan" => Propagation::Orphan,
                "background" => Propagation::Background,
                other => {
                    warn!(value = %other, "unknown BROOD_DELETE_PROPAGATION; using background");
                    Propagation::Background
                }
            };
        }
        if let Some(list) = get("BROOD_CHILD_KINDS") {
            cfg.child_kinds = parse_kinds(&list);
        }
        if let Some(list) = get("BROOD_CLUSTER_SCOPED_KINDS") {
            cfg.cluster_scoped = parse_kinds(&list);
        }
        cfg
    }

    /// Built-in cluster-scoped kinds plus [`ReconcilerConfig::cluster_scoped`].
    pub fn scopes(&self) -> ScopeTable {
        ScopeTable::default().with_kinds(&self.cluster_scoped)
    }
}

/// Comma-separated gvk keys, first occurrence kept; invalid entries are
/// skipped with a warning.
pub fn parse_kinds(list: &str) -> Vec<ResourceKind> {
    let mut kinds: Vec<ResourceKind> = Vec::new();
    for s in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match ResourceKind::parse(s) {
            Ok(k) if kinds.contains(&k) => debug!(entry = %s, "duplicate kind"),
            Ok(k) => kinds.push(k),
            Err(e) => warn!(entry = %s, error = %e, "ignoring kind"),
        }
    }
    kinds
}
