//! Brood patch: mutation steps applied to generated children.
//!
//! A step takes the whole child list and returns a whole replacement list.
//! [`PatcherChain`] runs steps strictly in order and stops at the first error,
//! so a later step never sees a list an earlier step failed to produce.

#![forbid(unsafe_code)]

use brood_core::prelude::*;
use tracing::{trace, warn};

mod merge;
mod steps;

pub use merge::merge_patch;
pub use steps::{GenerationAnnotation, NamespaceDefaulter, OverrideMerger, OwnerLabels, OwnerReferenceSetter, UniqueIdentities};

/// One transformation of the child list.
///
/// Implementations may hold configuration captured at construction, but no
/// state that changes between calls.
pub trait Patcher: Send + Sync {
    /// Name used in logs and in [`BroodError::Mutation`].
    fn name(&self) -> &str {
        "anonymous"
    }

    fn patch(&self, parent: &ParentResource, children: Vec<ChildResource>) -> Result<Vec<ChildResource>>;
}

impl<F> Patcher for F
where
    F: Fn(&ParentResource, Vec<ChildResource>) -> Result<Vec<ChildResource>> + Send + Sync,
{
    fn patch(&self, parent: &ParentResource, children: Vec<ChildResource>) -> Result<Vec<ChildResource>> {
        self(parent, children)
    }
}

/// A closure with a name.
pub struct PatcherFn<F> {
    name: String,
    f: F,
}

impl<F> PatcherFn<F>
where
    F: Fn(&ParentResource, Vec<ChildResource>) -> Result<Vec<ChildResource>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Patcher for PatcherFn<F>
where
    F: Fn(&ParentResource, Vec<ChildResource>) -> Result<Vec<ChildResource>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn patch(&self, parent: &ParentResource, children: Vec<ChildResource>) -> Result<Vec<ChildResource>> {
        (self.f)(parent, children)
    }
}

/// Ordered, fail-fast composition of steps. An empty chain returns its input.
#[derive(Default)]
pub struct PatcherChain {
    steps: Vec<Box<dyn Patcher>>,
}

impl PatcherChain {
    pub fn new() -> Self { Self::default() }

    pub fn with<P: Patcher + 'static>(mut self, step: P) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn push(&mut self, step: Box<dyn Patcher>) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize { self.steps.len() }
    pub fn is_empty(&self) -> bool { self.steps.is_empty() }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

impl Patcher for PatcherChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn patch(&self, parent: &ParentResource, children: Vec<ChildResource>) -> Result<Vec<ChildResource>> {
        let mut current = children;
        for step in &self.steps {
            let step_name = step.name();
            current = match step.patch(parent, current) {
                Ok(next) => next,
                Err(e) => {
                    warn!(parent = %parent.key, step = step_name, error = %e, "mutation step failed; aborting chain");
                    return Err(as_mutation(step_name, e));
                }
            };
            trace!(parent = %parent.key, step = step_name, count = current.len(), "mutation step ok");
        }
        Ok(current)
    }
}

/// Keep an inner step's attribution when chains nest.
fn as_mutation(step: &str, e: BroodError) -> BroodError {
    match e {
        e @ BroodError::Mutation { .. } => e,
        other => BroodError::mutation(step, other.to_string()),
    }
}

/// The standard chain applied to generated children before they are applied.
pub fn default_chain() -> PatcherChain {
    default_chain_with(ScopeTable::default())
}

/// [`default_chain`] with a scope table that knows extra cluster-scoped kinds.
pub fn default_chain_with(scopes: ScopeTable) -> PatcherChain {
    PatcherChain::new()
        .with(NamespaceDefaulter::new(scopes))
        .with(OverrideMerger::default())
        .with(OwnerLabels)
        .with(GenerationAnnotation)
        .with(OwnerReferenceSetter)
        .with(UniqueIdentities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brood_core::labels;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn parent() -> ParentResource {
        ParentResource::from_object(&json!({
            "apiVersion": "stacks.brood.dev/v1",
            "kind": "Stack",
            "metadata": { "name": "shop", "namespace": "prod", "uid": "0f0e0d0c-0b0a-4908-8706-050403020100", "generation": 7 },
            "spec": {}
        }))
        .unwrap()
    }

    fn child(name: &str) -> ChildResource {
        ChildResource::new(ResourceKind::new("", "v1", "ConfigMap"), ObjectKey::new(Some("prod"), name), json!({}))
    }

    #[test]
    fn empty_chain_is_identity() {
        let input = vec![child("b"), child("a"), child("c")];
        let out = PatcherChain::new().patch(&parent(), input.clone()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn steps_run_in_order() {
        let chain = PatcherChain::new()
            .with(PatcherFn::new("append-x", |_: &ParentResource, mut cs: Vec<ChildResource>| {
                cs.push(child("x"));
                Ok(cs)
            }))
            .with(PatcherFn::new("reverse", |_: &ParentResource, mut cs: Vec<ChildResource>| {
                cs.reverse();
                Ok(cs)
            }));
        let out = chain.patch(&parent(), vec![child("a")]).unwrap();
        let names: Vec<_> = out.iter().map(|c| c.key.name.as_str()).collect();
        assert_eq!(names, ["x", "a"]);
        assert_eq!(chain.names(), ["append-x", "reverse"]);
    }

    #[test]
    fn chain_stops_at_first_failure() {
        let tail_ran = Arc::new(AtomicBool::new(false));
        let tail_flag = Arc::clone(&tail_ran);
        let chain = PatcherChain::new()
            .with(PatcherFn::new("label", |_: &ParentResource, mut cs: Vec<ChildResource>| {
                for c in cs.iter_mut() { c.set_label("stage", "one"); }
                Ok(cs)
            }))
            .with(PatcherFn::new("merge", |_: &ParentResource, _cs: Vec<ChildResource>| Err(BroodError::Generation("bad merge".into()))))
            .with(PatcherFn::new("owner", move |_: &ParentResource, cs: Vec<ChildResource>| {
                tail_flag.store(true, Ordering::SeqCst);
                Ok(cs)
            }));
        let err = chain.patch(&parent(), vec![child("a")]).unwrap_err();
        match err {
            BroodError::Mutation { step, reason } => {
                assert_eq!(step, "merge");
                assert!(reason.contains("bad merge"), "{}", reason);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!tail_ran.load(Ordering::SeqCst), "step after the failure must not run");
    }

    #[test]
    fn nested_chain_keeps_inner_step_name() {
        let inner = PatcherChain::new().with(PatcherFn::new("inner-fail", |_: &ParentResource, _cs: Vec<ChildResource>| {
            Err(BroodError::mutation("inner-fail", "nope"))
        }));
        let outer = PatcherChain::new().with(inner);
        let err = outer.patch(&parent(), vec![]).unwrap_err();
        assert!(matches!(err, BroodError::Mutation { ref step, .. } if step == "inner-fail"), "{err}");
    }

    #[test]
    fn bare_closures_are_steps() {
        let step = |_: &ParentResource, cs: Vec<ChildResource>| -> Result<Vec<ChildResource>> { Ok(cs.into_iter().skip(1).collect()) };
        let out = PatcherChain::new().with(step).patch(&parent(), vec![child("a"), child("b")]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.name, "b");
    }

    #[test]
    fn default_chain_stamps_ownership() {
        let mut c = ChildResource::new(ResourceKind::new("", "v1", "ConfigMap"), ObjectKey::new(None, "shop-config"), json!({}));
        c.set_label(labels::ROLE, "config");
        let out = default_chain().patch(&parent(), vec![c]).unwrap();
        let c = &out[0];
        assert_eq!(c.key.namespace.as_deref(), Some("prod"));
        assert_eq!(c.label(labels::PARENT_UID), Some("0f0e0d0c-0b0a-4908-8706-050403020100"));
        assert_eq!(c.annotation(labels::PARENT_GENERATION), Some("7"));
        assert_eq!(c.owner_references().len(), 1);
        assert_eq!(c.label(labels::ROLE), Some("config"));
    }

    #[test]
    fn default_chain_with_extra_cluster_scoped_kinds() {
        let kind = ResourceKind::new("tenancy.example.dev", "v1", "Tenant");
        let c = ChildResource::new(kind.clone(), ObjectKey::new(None, "shop-tenant"), json!({}));
        let out = default_chain_with(ScopeTable::default().with_kinds([&kind])).patch(&parent(), vec![c.clone()]).unwrap();
        assert_eq!(out[0].key.namespace, None);
        assert!(out[0].owner_references().is_empty());
        assert_eq!(default_chain().patch(&parent(), vec![c]).unwrap()[0].key.namespace.as_deref(), Some("prod"));
    }
}
