//! Brood kubehub: the Kubernetes side of a reconcile cycle.
//!
//! Discovery is cached per process in an [`ApiResolver`]. Observed children
//! are listed by ownership label ([`KubeLister`]) and orphans are removed one
//! call at a time ([`KubeDeleter`]).

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use brood_core::prelude::*;
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::{mpsc, OnceCell, RwLock};
use tracing::{debug, info, warn};

mod children;

pub use children::{delete_params, KubeDeleter, KubeLister};

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Process-wide client from the ambient kubeconfig or in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let c = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("creating kube client") })
        .await?;
    Ok(c.clone())
}

/// Maps kinds to API resources, running discovery at most once per miss.
pub struct ApiResolver {
    client: Client,
    cache: RwLock<FxHashMap<ResourceKind, (ApiResource, bool)>>,
}

impl ApiResolver {
    pub fn new(client: Client) -> Self {
        Self { client, cache: RwLock::new(FxHashMap::default()) }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// API resource and namespaced flag for `kind`, or `None` if the server
    /// does not serve it.
    pub async fn resolve(&self, kind: &ResourceKind) -> Result<Option<(ApiResource, bool)>> {
        if let Some(hit) = self.cache.read().await.get(kind) {
            return Ok(Some(hit.clone()));
        }
        let discovery = Discovery::new(self.client.clone()).run().await.context("running API discovery")?;
        let mut cache = self.cache.write().await;
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    cache.insert(ResourceKind::new(&ar.group, &ar.version, &ar.kind), (ar, namespaced));
                }
            }
        }
        debug!(kinds = cache.len(), "discovery cache refreshed");
        Ok(cache.get(kind).cloned())
    }

    /// Like [`ApiResolver::resolve`], failing on kinds the server does not serve.
    pub async fn require(&self, kind: &ResourceKind) -> Result<(ApiResource, bool)> {
        self.resolve(kind).await?.ok_or_else(|| anyhow!("GVK not found: {}", kind))
    }

    /// Api for one object of `kind`. Namespaced kinds need a namespace.
    pub async fn api_for(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.require(kind).await?;
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        match namespace {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            None => Err(anyhow!("namespace required for namespaced kind {}", kind)),
        }
    }

    /// Api for listing or watching `kind`; a missing namespace means all namespaces.
    pub fn scoped_api(&self, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
        match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        }
    }
}

pub(crate) fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Full JSON for `obj`; list and watch items lack TypeMeta, so it comes from `kind`.
pub fn object_json(kind: &ResourceKind, obj: &DynamicObject) -> Result<Json> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    if let Some(map) = raw.as_object_mut() {
        map.insert("apiVersion".into(), Json::String(kind.api_version()));
        map.insert("kind".into(), Json::String(kind.kind.clone()));
    }
    Ok(raw)
}

pub fn parent_from_object(kind: &ResourceKind, obj: &DynamicObject) -> Result<ParentResource> {
    let raw = object_json(kind, obj)?;
    Ok(ParentResource::from_object(&raw)?)
}

pub fn child_from_object(kind: &ResourceKind, obj: &DynamicObject) -> Result<ChildResource> {
    Ok(ChildResource::from_manifest(object_json(kind, obj)?)?)
}

/// Fetch one parent object by name.
pub async fn fetch_parent(resolver: &ApiResolver, kind: &ResourceKind, namespace: Option<&str>, name: &str) -> Result<ParentResource> {
    let api = resolver.api_for(kind, namespace).await?;
    let obj = api.get(name).await.with_context(|| format!("getting {} {}", kind, name))?;
    parent_from_object(kind, &obj)
}

/// What the parent watch reports.
#[derive(Debug, Clone)]
pub enum ParentEvent {
    Applied(ParentResource),
    Deleted(ObjectKey),
    /// Full relist after a (re)connect; replaces everything seen before.
    Restarted(Vec<ParentResource>),
}

/// List+watch parents of `kind` and forward events into `tx`.
///
/// Returns when `tx` closes or the stream ends.
pub async fn watch_parents(resolver: &ApiResolver, kind: &ResourceKind, namespace: Option<&str>, tx: mpsc::Sender<ParentEvent>) -> Result<()> {
    let (ar, namespaced) = resolver.require(kind).await?;
    let api = resolver.scoped_api(&ar, namespaced, namespace);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(gvk = %kind, ns = ?namespace, "parent watcher started");
    while let Some(ev) = stream.try_next().await? {
        let out = match ev {
            Event::Applied(o) => match parent_from_object(kind, &o) {
                Ok(p) => ParentEvent::Applied(p),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable parent");
                    continue;
                }
            },
            Event::Deleted(o) => match o.metadata.name.as_deref() {
                Some(name) => ParentEvent::Deleted(ObjectKey::new(o.metadata.namespace.as_deref(), name)),
                None => continue,
            },
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                let parents = list
                    .iter()
                    .filter_map(|o| parent_from_object(kind, o).map_err(|e| warn!(error = %e, "skipping unreadable parent")).ok())
                    .collect();
                ParentEvent::Restarted(parents)
            }
        };
        if tx.send(out).await.is_err() {
            debug!("parent receiver closed");
            return Ok(());
        }
    }
    warn!("parent watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::GroupVersionKind;
    use serde_json::json;

    fn widget_ar() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("example.dev", "v1", "Widget"))
    }

    #[test]
    fn parent_from_list_item_fills_type_meta() {
        let mut obj = DynamicObject::new("w1", &widget_ar()).within("shop").data(json!({ "spec": { "size": 3 } }));
        obj.types = None;
        obj.metadata.uid = Some("7c0f2a8e-51c4-4a9e-9b51-3c1f2d0b8e11".into());
        obj.metadata.generation = Some(4);
        let kind = ResourceKind::new("example.dev", "v1", "Widget");
        let p = parent_from_object(&kind, &obj).unwrap();
        assert_eq!(p.kind, kind);
        assert_eq!(p.key, ObjectKey::new(Some("shop"), "w1"));
        assert_eq!(p.generation, 4);
        assert_eq!(p.spec["size"], 3);
    }

    #[test]
    fn child_from_object_drops_managed_fields() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        let mut obj = DynamicObject::new("w1-config", &ar).within("shop").data(json!({ "data": { "k": "v" } }));
        obj.metadata.managed_fields = Some(vec![Default::default()]);
        let kind = ResourceKind::new("", "v1", "ConfigMap");
        let c = child_from_object(&kind, &obj).unwrap();
        assert_eq!(c.identity().to_string(), "v1/ConfigMap shop/w1-config");
        assert!(c.body["metadata"].get("managedFields").is_none());
        assert_eq!(c.body["apiVersion"], "v1");
        assert_eq!(c.body["data"]["k"], "v");
    }

    #[test]
    fn child_without_name_is_rejected() {
        let mut obj = DynamicObject::new("x", &widget_ar());
        obj.metadata.name = None;
        let err = child_from_object(&ResourceKind::new("example.dev", "v1", "Widget"), &obj).unwrap_err();
        assert!(err.to_string().contains("missing metadata.name"));
    }
}
