//! Brood apply: server-side apply of desired children, with change reporting.
//!
//! Every child is validated by a server dry-run before any of them is
//! written, so a bad manifest fails the cycle without a half-applied set.
//! Apply always runs; whether a child counts as created, updated or unchanged
//! is read from the live object and the server's answer.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use brood_core::prelude::*;
use brood_kubehub::ApiResolver;
use brood_reconcile::{ApplySummary, ChildApplier};
use kube::{
    api::{Api, Patch, PatchParams},
    core::DynamicObject,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ApplyConfig {
    pub field_manager: String,
    /// Take ownership of fields another manager set.
    pub force: bool,
    /// Stop after the server dry-run.
    pub dry_run: bool,
    pub max_nodes: usize,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self { field_manager: "brood".into(), force: true, dry_run: false, max_nodes: 100_000 }
    }
}

impl ApplyConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(m) = get("BROOD_FIELD_MANAGER").filter(|s| !s.is_empty()) {
            cfg.field_manager = m;
        }
        if let Some(v) = get("BROOD_FORCE_APPLY") {
            cfg.force = !(v == "0" || v.eq_ignore_ascii_case("false"));
        }
        cfg.dry_run = get("BROOD_DRY_RUN").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        if let Some(n) = get("BROOD_MAX_MANIFEST_NODES").and_then(|s| s.parse::<usize>().ok()) {
            cfg.max_nodes = n;
        }
        cfg
    }

    fn patch_params(&self, dry_run: bool) -> PatchParams {
        let mut pp = PatchParams::apply(&self.field_manager);
        if self.force {
            pp = pp.force();
        }
        if dry_run {
            pp = pp.dry_run();
        }
        pp
    }
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Updated,
    Unchanged,
}

/// How applying changed an object, from the live copy before apply and the
/// object the server returned. Removed fields count: a field the manifest
/// dropped disappears from the server's answer.
pub fn classify(live: Option<&Json>, applied: &Json) -> Change {
    match live {
        None => Change::Created,
        Some(before) if diff_summary(&strip_noisy(applied.clone()), &strip_noisy(before.clone())).is_empty() => Change::Unchanged,
        Some(_) => Change::Updated,
    }
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for k in bo.keys() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            // Null base: the whole target is new
            (_, V::Null) => { *adds += 1; }
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

/// One child resolved against the cluster and checked by a server dry-run.
struct Prepared {
    identity: ChildIdentity,
    api: Api<DynamicObject>,
    manifest: Json,
    live: Option<Json>,
    dry_run: Json,
}

pub struct KubeApplier {
    resolver: Arc<ApiResolver>,
    config: ApplyConfig,
}

impl KubeApplier {
    pub fn new(resolver: Arc<ApiResolver>, config: ApplyConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &ApplyConfig {
        &self.config
    }

    async fn prepare(&self, child: &ChildResource) -> Result<Prepared> {
        let manifest = child.manifest();
        if json_node_budget_exceeded(&manifest, self.config.max_nodes) {
            return Err(anyhow!("manifest too complex (>{} nodes)", self.config.max_nodes));
        }
        let api = self.resolver.api_for(&child.kind, child.key.namespace.as_deref()).await?;
        let live = match api.get_opt(&child.key.name).await.context("reading live object")? {
            Some(obj) => Some(serde_json::to_value(&obj)?),
            None => None,
        };
        let answer = api
            .patch(&child.key.name, &self.config.patch_params(true), &Patch::Apply(&manifest))
            .await
            .map_err(|e| anyhow!("dry-run failed: {}", e))?;
        let dry_run = serde_json::to_value(&answer)?;
        Ok(Prepared { identity: child.identity(), api, manifest, live, dry_run })
    }
}

fn apply_error(id: &ChildIdentity, e: anyhow::Error) -> BroodError {
    counter!("apply_err", 1u64);
    BroodError::Apply(format!("{}: {:#}", id, e))
}

#[async_trait]
impl ChildApplier for KubeApplier {
    async fn apply(&self, parent: &ParentResource, children: &[ChildResource]) -> brood_core::Result<ApplySummary> {
        let t0 = Instant::now();
        let mut prepared = Vec::with_capacity(children.len());
        for child in children {
            let p = self.prepare(child).await.map_err(|e| apply_error(&child.identity(), e))?;
            prepared.push(p);
        }
        let mut summary = ApplySummary::default();
        for p in prepared {
            let applied = if self.config.dry_run {
                p.dry_run
            } else {
                let obj = p
                    .api
                    .patch(&p.identity.key.name, &self.config.patch_params(false), &Patch::Apply(&p.manifest))
                    .await
                    .map_err(|e| apply_error(&p.identity, anyhow!("server-side apply failed: {}", e)))?;
                counter!("apply_ok", 1u64);
                serde_json::to_value(&obj).map_err(|e| apply_error(&p.identity, e.into()))?
            };
            let change = classify(p.live.as_ref(), &applied);
            debug!(child = %p.identity, ?change, dry_run = self.config.dry_run, "applied");
            match change {
                Change::Created => summary.created.push(p.identity),
                Change::Updated => summary.updated.push(p.identity),
                Change::Unchanged => summary.unchanged.push(p.identity),
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(parent = %parent.key, created = summary.created.len(), updated = summary.updated.len(), unchanged = summary.unchanged.len(), "children applied");
        Ok(summary)
    }
}
