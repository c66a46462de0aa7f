use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use brood_core::prelude::*;
use brood_core::{labels, DeleteFailure};
use brood_prune::{DeleteContext, Deleter, PartialDeletion, Propagation};
use brood_reconcile::ObservedLister;
use kube::api::{DeleteParams, ListParams, Preconditions, PropagationPolicy};
use tracing::{debug, info, warn};

use crate::{child_from_object, ApiResolver};

/// Lists a parent's children by ownership label.
///
/// Every kind is listed cluster-wide: the selector names a single parent, and
/// children may live outside the parent's namespace. Kinds the server does not
/// serve have no children and are skipped.
pub struct KubeLister {
    resolver: Arc<ApiResolver>,
}

impl KubeLister {
    pub fn new(resolver: Arc<ApiResolver>) -> Self {
        Self { resolver }
    }

    async fn list_kind(&self, kind: &ResourceKind, selector: &str) -> Result<Vec<ChildResource>> {
        let Some((ar, namespaced)) = self.resolver.resolve(kind).await? else {
            warn!(gvk = %kind, "kind not served; nothing to list");
            return Ok(Vec::new());
        };
        let api = self.resolver.scoped_api(&ar, namespaced, None);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        let mut out = list.items.iter().map(|o| child_from_object(kind, o)).collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

#[async_trait]
impl ObservedLister for KubeLister {
    async fn observed(&self, parent: &ParentResource, kinds: &[ResourceKind]) -> brood_core::Result<Vec<ChildResource>> {
        let selector = labels::ownership_selector(parent);
        let mut out = Vec::new();
        for kind in kinds {
            let found = self
                .list_kind(kind, &selector)
                .await
                .map_err(|e| BroodError::Cluster(format!("listing {}: {:#}", kind, e)))?;
            debug!(gvk = %kind, count = found.len(), "observed children");
            out.extend(found);
        }
        Ok(out)
    }
}

/// Delete parameters for one child. A known uid becomes a precondition so a
/// re-created object with the same name is left alone.
pub fn delete_params(ctx: &DeleteContext, uid: Option<&str>) -> DeleteParams {
    let propagation = match ctx.propagation {
        Propagation::Background => PropagationPolicy::Background,
        Propagation::Foreground => PropagationPolicy::Foreground,
        Propagation::Orphan => PropagationPolicy::Orphan,
    };
    DeleteParams {
        dry_run: ctx.dry_run,
        propagation_policy: Some(propagation),
        preconditions: uid.map(|u| Preconditions { uid: Some(u.to_string()), resource_version: None }),
        ..DeleteParams::default()
    }
}

/// Deletes children one by one and keeps going past failures.
pub struct KubeDeleter {
    resolver: Arc<ApiResolver>,
}

impl KubeDeleter {
    pub fn new(resolver: Arc<ApiResolver>) -> Self {
        Self { resolver }
    }

    async fn delete_one(&self, ctx: &DeleteContext, child: &ChildResource) -> Result<()> {
        let api = self.resolver.api_for(&child.kind, child.key.namespace.as_deref()).await?;
        let dp = delete_params(ctx, child.uid());
        let call = api.delete(&child.key.name, &dp);
        let res = match ctx.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| anyhow!("delete timed out after {:?}", limit))?,
            None => call.await,
        };
        match res {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(child = %child.identity(), "already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Deleter for KubeDeleter {
    async fn delete(&self, ctx: &DeleteContext, children: Vec<ChildResource>) -> Result<Vec<ChildResource>, PartialDeletion> {
        let requested = children.len();
        let mut deleted = Vec::with_capacity(requested);
        let mut failures = Vec::new();
        for child in children {
            match self.delete_one(ctx, &child).await {
                Ok(()) => {
                    info!(child = %child.identity(), dry_run = ctx.dry_run, "deleted");
                    deleted.push(child);
                }
                Err(e) => {
                    warn!(child = %child.identity(), error = %e, "delete failed");
                    failures.push(DeleteFailure { identity: child.identity(), reason: format!("{:#}", e) });
                }
            }
        }
        if failures.is_empty() {
            Ok(deleted)
        } else {
            Err(PartialDeletion { requested, deleted, failures })
        }
    }
}
