//! Brood prune: find orphaned children and hand them to a deleter.
//!
//! [`resolve`] is a pure set difference by identity. Deletion is best-effort:
//! whatever survives a cycle shows up in the next cycle's observed set and is
//! resolved again, so nothing here keeps retry state.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use brood_core::prelude::*;
use brood_core::DeleteFailure;
use futures::future::BoxFuture;
use metrics::counter;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Observed children whose object is absent from `desired`, in observed order.
///
/// Objects are compared by group, kind, namespace and name: a child listed
/// under another served version of a desired kind is the same object and is
/// kept. A desired child is never returned, even if its content drifted:
/// updating it is the applier's job. An object observed more than once is
/// returned once.
pub fn resolve(observed: &[ChildResource], desired: &[ChildResource]) -> Vec<ChildResource> {
    let ids: Vec<ChildIdentity> = desired.iter().map(|c| c.identity()).collect();
    let wanted: FxHashSet<_> = ids.iter().map(|id| id.object_ref()).collect();
    let mut seen = FxHashSet::default();
    observed
        .iter()
        .filter(|c| {
            let key = (c.kind.group.as_str(), c.kind.kind.as_str(), &c.key);
            !wanted.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagation {
    #[default]
    Background,
    Foreground,
    Orphan,
}

/// Per-call deletion settings handed to the deleter.
#[derive(Debug, Clone, Default)]
pub struct DeleteContext {
    /// Upper bound for each delete call; `None` waits as long as the client does.
    pub timeout: Option<Duration>,
    pub dry_run: bool,
    pub propagation: Propagation,
}

/// A deleter's report when not everything it was given is gone.
///
/// `deleted` is empty when nothing could be done at all.
#[derive(Debug, Clone, thiserror::Error)]
#[error("deleted {} of {requested} children, {} failed", .deleted.len(), .failures.len())]
pub struct PartialDeletion {
    pub requested: usize,
    pub deleted: Vec<ChildResource>,
    pub failures: Vec<DeleteFailure>,
}

impl From<PartialDeletion> for BroodError {
    fn from(p: PartialDeletion) -> Self {
        BroodError::PartialDeletion { requested: p.requested, deleted: p.deleted.len(), failures: p.failures }
    }
}

/// External capability that removes children from the backing store.
#[async_trait]
pub trait Deleter: Send + Sync {
    /// Delete `children`. `Ok` carries every child that is now gone, including
    /// ones that were already missing.
    async fn delete(&self, ctx: &DeleteContext, children: Vec<ChildResource>) -> Result<Vec<ChildResource>, PartialDeletion>;
}

pub type DeleteFuture = BoxFuture<'static, Result<Vec<ChildResource>, PartialDeletion>>;

/// Adapter turning a function that returns a boxed future into a [`Deleter`].
pub struct DeleterFn<F>(pub F);

#[async_trait]
impl<F> Deleter for DeleterFn<F>
where
    F: Fn(DeleteContext, Vec<ChildResource>) -> DeleteFuture + Send + Sync,
{
    async fn delete(&self, ctx: &DeleteContext, children: Vec<ChildResource>) -> Result<Vec<ChildResource>, PartialDeletion> {
        (self.0)(ctx.clone(), children).await
    }
}

/// What one cleanup pass asked for and achieved.
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub candidates: Vec<ChildIdentity>,
    pub deleted: Vec<ChildIdentity>,
    pub failures: Vec<DeleteFailure>,
}

impl PruneReport {
    /// Every candidate is gone.
    pub fn is_complete(&self) -> bool {
        self.pending().is_empty()
    }

    /// Candidates that still exist and will be retried next cycle.
    pub fn pending(&self) -> Vec<ChildIdentity> {
        let gone: FxHashSet<&ChildIdentity> = self.deleted.iter().collect();
        self.candidates.iter().filter(|c| !gone.contains(c)).cloned().collect()
    }
}

/// Resolve orphans and delete them through `deleter`.
///
/// The deleter is not called when there is nothing to delete.
pub async fn prune<D: Deleter + ?Sized>(ctx: &DeleteContext, observed: &[ChildResource], desired: &[ChildResource], deleter: &D) -> PruneReport {
    let candidates = resolve(observed, desired);
    if candidates.is_empty() {
        debug!(observed = observed.len(), desired = desired.len(), "no orphans to prune");
        return PruneReport::default();
    }
    let ids: Vec<ChildIdentity> = candidates.iter().map(|c| c.identity()).collect();
    info!(count = ids.len(), dry_run = ctx.dry_run, "pruning orphaned children");
    match deleter.delete(ctx, candidates).await {
        Ok(deleted) => {
            counter!("prune_deleted_total", deleted.len() as u64);
            PruneReport { candidates: ids, deleted: deleted.iter().map(|c| c.identity()).collect(), failures: Vec::new() }
        }
        Err(partial) => {
            counter!("prune_deleted_total", partial.deleted.len() as u64);
            counter!("prune_failed_total", partial.failures.len() as u64);
            warn!(requested = partial.requested, deleted = partial.deleted.len(), failed = partial.failures.len(), "partial deletion; remaining children retried next cycle");
            for f in &partial.failures {
                debug!(child = %f.identity, reason = %f.reason, "delete failed");
            }
            PruneReport { candidates: ids, deleted: partial.deleted.iter().map(|c| c.identity()).collect(), failures: partial.failures }
        }
    }
}
