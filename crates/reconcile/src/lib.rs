//! Brood reconcile: one generate → patch → apply → prune cycle for a parent.
//!
//! The [`Reconciler`] owns no mutable state. Cycles for different parents may
//! run concurrently on clones of it; a single parent's cycle runs its stages
//! strictly in sequence.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use brood_core::prelude::*;
use brood_core::DeleteFailure;
use brood_patch::Patcher;
use brood_prune::{prune, Deleter};
use brood_render::{generate_checked, Generator};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

mod config;

pub use config::{parse_kinds, ReconcilerConfig};

/// Writes desired children to the backing store.
#[async_trait]
pub trait ChildApplier: Send + Sync {
    async fn apply(&self, parent: &ParentResource, children: &[ChildResource]) -> Result<ApplySummary>;
}

/// Reads the children a parent currently owns.
#[async_trait]
pub trait ObservedLister: Send + Sync {
    /// Children of `parent` among objects of `kinds`.
    async fn observed(&self, parent: &ParentResource, kinds: &[ResourceKind]) -> Result<Vec<ChildResource>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub created: Vec<ChildIdentity>,
    pub updated: Vec<ChildIdentity>,
    pub unchanged: Vec<ChildIdentity>,
}

impl ApplySummary {
    pub fn total(&self) -> usize {
        self.created.len() + self.updated.len() + self.unchanged.len()
    }
}

/// Desired children and the orphans they imply, computed without I/O.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub desired: Vec<ChildResource>,
    pub deletions: Vec<ChildResource>,
}

impl Plan {
    pub fn from_desired(desired: Vec<ChildResource>, observed: &[ChildResource]) -> Self {
        let deletions = brood_prune::resolve(observed, &desired);
        Self { desired, deletions }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub parent: ObjectKey,
    pub generation: i64,
    pub applied: ApplySummary,
    /// Cleanup ran (it is skipped when disabled in config).
    pub pruned: bool,
    pub deleted: Vec<ChildIdentity>,
    /// Orphans still present; the next cycle picks them up again.
    pub pending_deletions: Vec<ChildIdentity>,
    pub failures: Vec<DeleteFailure>,
}

impl ReconcileOutcome {
    pub fn is_complete(&self) -> bool {
        self.pending_deletions.is_empty()
    }

    /// The partial deletion as an error value, for callers that track it as one.
    pub fn partial_deletion(&self) -> Option<BroodError> {
        if self.is_complete() {
            return None;
        }
        Some(BroodError::PartialDeletion {
            requested: self.deleted.len() + self.pending_deletions.len(),
            deleted: self.deleted.len(),
            failures: self.failures.clone(),
        })
    }
}

#[derive(Clone)]
pub struct Reconciler {
    generator: Arc<dyn Generator>,
    pipeline: Arc<dyn Patcher>,
    applier: Arc<dyn ChildApplier>,
    lister: Arc<dyn ObservedLister>,
    deleter: Arc<dyn Deleter>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Reconciler with [`brood_patch::default_chain`] and default config.
    pub fn new<G, A, L, D>(generator: G, applier: A, lister: L, deleter: D) -> Self
    where
        G: Generator + 'static,
        A: ChildApplier + 'static,
        L: ObservedLister + 'static,
        D: Deleter + 'static,
    {
        Self {
            generator: Arc::new(generator),
            pipeline: Arc::new(brood_patch::default_chain()),
            applier: Arc::new(applier),
            lister: Arc::new(lister),
            deleter: Arc::new(deleter),
            config: ReconcilerConfig::default(),
        }
    }

    pub fn with_pipeline<P: Patcher + 'static>(mut self, pipeline: P) -> Self {
        self.pipeline = Arc::new(pipeline);
        self
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Generate and patch: the children `parent` wants right now.
    pub fn desired(&self, parent: &ParentResource) -> Result<Vec<ChildResource>> {
        let generated = generate_checked(self.generator.as_ref(), parent)?;
        self.pipeline.patch(parent, generated).map_err(|e| match e {
            e @ BroodError::Mutation { .. } => e,
            other => BroodError::mutation(self.pipeline.name(), other.to_string()),
        })
    }

    /// What a cycle would do given `observed`, without touching anything.
    pub fn plan(&self, parent: &ParentResource, observed: &[ChildResource]) -> Result<Plan> {
        Ok(Plan::from_desired(self.desired(parent)?, observed))
    }

    /// Configured kinds first, then any other kind in `desired`. A kind is
    /// listed under one version only.
    pub fn watched_kinds(&self, desired: &[ChildResource]) -> Vec<ResourceKind> {
        let mut kinds = self.config.child_kinds.clone();
        for c in desired {
            if !kinds.iter().any(|k| k.group == c.kind.group && k.kind == c.kind.kind) {
                kinds.push(c.kind.clone());
            }
        }
        kinds
    }

    /// Run one full cycle.
    ///
    /// Generation, mutation and apply failures end the cycle before anything
    /// is deleted. A partial deletion is not an error: it is reported in the
    /// outcome and retried by the next cycle.
    pub async fn reconcile(&self, parent: &ParentResource) -> Result<ReconcileOutcome> {
        let started = Instant::now();
        counter!("reconcile_total", 1u64);
        let span = info_span!("reconcile", parent = %parent.key, kind = %parent.kind, generation = parent.generation);
        let res = self.cycle(parent).instrument(span).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(o) => info!(
                parent = %parent.key,
                applied = o.applied.total(),
                deleted = o.deleted.len(),
                pending = o.pending_deletions.len(),
                "reconciled"
            ),
            Err(e) => {
                counter!("reconcile_err", 1u64);
                warn!(parent = %parent.key, kind = ?e.kind(), error = %e, "reconcile failed");
            }
        }
        res
    }

    /// Delete every child of a parent that no longer exists.
    ///
    /// `parent` is the last copy seen before deletion. Owner references let
    /// the garbage collector remove same-namespace children, but not
    /// cluster-scoped ones or ones in other namespaces, so all of them are
    /// deleted here. Nothing is applied. Kinds come from the config and from
    /// what the last copy would have generated; if generation fails only the
    /// configured kinds are searched.
    pub async fn release(&self, parent: &ParentResource) -> Result<ReconcileOutcome> {
        let span = info_span!("release", parent = %parent.key, kind = %parent.kind);
        let res = self.release_cycle(parent).instrument(span).await;
        match &res {
            Ok(o) => info!(parent = %parent.key, deleted = o.deleted.len(), pending = o.pending_deletions.len(), "released children"),
            Err(e) => warn!(parent = %parent.key, kind = ?e.kind(), error = %e, "release failed"),
        }
        res
    }

    async fn release_cycle(&self, parent: &ParentResource) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome { parent: parent.key.clone(), generation: parent.generation, ..Default::default() };
        if !self.config.prune {
            debug!("prune disabled; leaving children of deleted parent");
            return Ok(outcome);
        }
        let last = self.desired(parent).unwrap_or_else(|e| {
            debug!(error = %e, "last copy does not generate; searching configured kinds only");
            Vec::new()
        });
        self.cleanup(parent, &self.watched_kinds(&last), &[], &mut outcome).await?;
        Ok(outcome)
    }

    async fn cycle(&self, parent: &ParentResource) -> Result<ReconcileOutcome> {
        let desired = self.desired(parent)?;
        let applied = self.applier.apply(parent, &desired).await?;
        let mut outcome = ReconcileOutcome { parent: parent.key.clone(), generation: parent.generation, applied, ..Default::default() };
        if !self.config.prune {
            debug!("prune disabled; skipping cleanup");
            return Ok(outcome);
        }
        self.cleanup(parent, &self.watched_kinds(&desired), &desired, &mut outcome).await?;
        Ok(outcome)
    }

    async fn cleanup(&self, parent: &ParentResource, kinds: &[ResourceKind], desired: &[ChildResource], outcome: &mut ReconcileOutcome) -> Result<()> {
        let observed = self.lister.observed(parent, kinds).await?;
        let report = prune(&self.config.delete, &observed, desired, self.deleter.as_ref()).await;
        outcome.pruned = true;
        outcome.pending_deletions = report.pending();
        outcome.deleted = report.deleted;
        outcome.failures = report.failures;
        Ok(())
    }
}
