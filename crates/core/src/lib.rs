//! Brood core types: parent/child resources, identities and error kinds.
//!
//! Everything here is plain data. Generators, mutation steps and the cleanup
//! resolver in the sibling crates operate on these values without touching a
//! cluster.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

mod error;
mod identity;
pub mod labels;
pub mod scope;

pub use error::{BroodError, DeleteFailure, ErrorKind, Result};
pub use identity::{child_name, ensure_unique, is_dns1123_label, MAX_NAME_LEN};
pub use scope::ScopeTable;

/// Group/Version/Kind of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build from an object's `apiVersion` (`v1` or `group/v1`) and `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Parse a key of the form `v1/Kind` or `group/v1/Kind`.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(*group, *version, *kind)),
            _ => Err(BroodError::InvalidObject(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() { format!("{}/{}", self.version, self.kind) } else { format!("{}/{}/{}", self.group, self.version, self.kind) }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// Namespace + name. `namespace` is `None` for cluster-scoped objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Stable key of a child: kind plus namespace/name, independent of content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChildIdentity {
    pub kind: ResourceKind,
    pub key: ObjectKey,
}

impl ChildIdentity {
    /// Identity of the child playing `role` for `parent`.
    ///
    /// Depends only on the parent's namespace/name and the role, never on the
    /// parent's payload, so every cycle for the same parent derives the same
    /// identity. Cluster-scoped kinds get no namespace.
    pub fn for_role(parent: &ParentResource, kind: ResourceKind, role: &str, scopes: &ScopeTable) -> Result<Self> {
        let name = child_name(&parent.key.name, role)?;
        let namespace = if scopes.is_cluster_scoped(&kind) { None } else { parent.key.namespace.clone() };
        Ok(Self { kind, key: ObjectKey { namespace, name } })
    }

    /// Group, kind, namespace and name of the stored object. The API server
    /// keeps one object for all served versions of a kind, so two identities
    /// that differ only in version name the same object.
    pub fn object_ref(&self) -> (&str, &str, &ObjectKey) {
        (&self.kind.group, &self.kind.kind, &self.key)
    }
}

impl fmt::Display for ChildIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// Controller owner reference as it appears in `metadata.ownerReferences`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

/// The declarative input of one reconciliation cycle. Treated as immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentResource {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub uid: Option<String>,
    pub generation: i64,
    pub labels: BTreeMap<String, String>,
    /// Opaque payload consumed by generators.
    pub spec: Json,
}

impl ParentResource {
    /// Read a parent from a full Kubernetes object.
    pub fn from_object(obj: &Json) -> Result<Self> {
        let api_version = str_field(obj, "apiVersion").ok_or_else(|| BroodError::InvalidObject("parent missing apiVersion".into()))?;
        let kind = str_field(obj, "kind").ok_or_else(|| BroodError::InvalidObject("parent missing kind".into()))?;
        let meta = obj.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BroodError::InvalidObject("parent missing metadata.name".into()))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        let uid = meta.and_then(|m| m.get("uid")).and_then(|v| v.as_str()).map(|s| s.to_string());
        let generation = meta.and_then(|m| m.get("generation")).and_then(|v| v.as_i64()).unwrap_or(0);
        let labels = meta.and_then(|m| m.get("labels")).map(string_map).unwrap_or_default();
        Ok(Self {
            kind: ResourceKind::from_api_version(api_version, kind),
            key: ObjectKey::new(namespace, name),
            uid,
            generation,
            labels,
            spec: obj.get("spec").cloned().unwrap_or_else(|| Json::Object(Map::new())),
        })
    }

    /// Controller owner reference pointing at this parent, if it has a uid.
    pub fn owner_ref(&self) -> Option<OwnerRef> {
        let uid = self.uid.as_ref()?;
        Some(OwnerRef {
            api_version: self.kind.api_version(),
            kind: self.kind.kind.clone(),
            name: self.key.name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

/// One desired or observed dependent object.
///
/// `body` is the whole object, metadata included. The identity fields are
/// authoritative: [`ChildResource::manifest`] always renders them over
/// whatever the body says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildResource {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub body: Json,
}

impl ChildResource {
    pub fn new(kind: ResourceKind, key: ObjectKey, body: Json) -> Self {
        let body = if body.is_object() { body } else { Json::Object(Map::new()) };
        Self { kind, key, body }
    }

    /// Parse a manifest that carries its own identity.
    pub fn from_manifest(manifest: Json) -> Result<Self> {
        let api_version = str_field(&manifest, "apiVersion").ok_or_else(|| BroodError::InvalidObject("manifest missing apiVersion".into()))?;
        let kind = str_field(&manifest, "kind").ok_or_else(|| BroodError::InvalidObject("manifest missing kind".into()))?;
        let meta = manifest.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BroodError::InvalidObject("manifest missing metadata.name".into()))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        let kind = ResourceKind::from_api_version(api_version, kind);
        let key = ObjectKey::new(namespace, name);
        Ok(Self::new(kind, key, manifest))
    }

    pub fn identity(&self) -> ChildIdentity {
        ChildIdentity { kind: self.kind.clone(), key: self.key.clone() }
    }

    /// Full object with apiVersion/kind/name/namespace taken from the identity.
    pub fn manifest(&self) -> Json {
        let mut v = self.body.clone();
        let obj = object_mut(&mut v);
        obj.insert("apiVersion".into(), Json::String(self.kind.api_version()));
        obj.insert("kind".into(), Json::String(self.kind.kind.clone()));
        let meta = object_mut(obj.entry("metadata").or_insert_with(|| Json::Object(Map::new())));
        meta.insert("name".into(), Json::String(self.key.name.clone()));
        match &self.key.namespace {
            Some(ns) => { meta.insert("namespace".into(), Json::String(ns.clone())); }
            None => { meta.remove("namespace"); }
        }
        v
    }

    pub fn set_namespace(&mut self, namespace: Option<String>) {
        self.key.namespace = namespace;
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.body.pointer("/metadata/labels").map(string_map).unwrap_or_default()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.body.get("metadata")?.get("labels")?.get(key)?.as_str()
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        let labels = object_mut(self.metadata_mut().entry("labels").or_insert_with(|| Json::Object(Map::new())));
        labels.insert(key.to_string(), Json::String(value.to_string()));
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.body.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let annos = object_mut(self.metadata_mut().entry("annotations").or_insert_with(|| Json::Object(Map::new())));
        annos.insert(key.to_string(), Json::String(value.to_string()));
    }

    /// `metadata.uid` of an observed object; desired children have none.
    /// The body sets `metadata.namespace` to `""`: the child is cluster-scoped
    /// even if the scope table does not know its kind.
    pub fn declares_cluster_scope(&self) -> bool {
        self.body.pointer("/metadata/namespace").and_then(|v| v.as_str()) == Some("")
    }

    pub fn uid(&self) -> Option<&str> {
        self.body.get("metadata")?.get("uid")?.as_str()
    }

    pub fn owner_references(&self) -> Vec<OwnerRef> {
        self.body
            .pointer("/metadata/ownerReferences")
            .and_then(|v| serde_json::from_value::<Vec<OwnerRef>>(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Insert `owner`, replacing any reference with the same uid. A controller
    /// reference also replaces any other controller reference.
    pub fn set_owner_reference(&mut self, owner: OwnerRef) {
        let mut refs = self.owner_references();
        let is_controller = owner.controller == Some(true);
        refs.retain(|r| r.uid != owner.uid && !(is_controller && r.controller == Some(true)));
        refs.push(owner);
        let value = serde_json::to_value(refs).unwrap_or(Json::Null);
        self.metadata_mut().insert("ownerReferences".into(), value);
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Json> {
        let obj = object_mut(&mut self.body);
        object_mut(obj.entry("metadata").or_insert_with(|| Json::Object(Map::new())))
    }
}

pub mod prelude {
    pub use super::{BroodError, ChildIdentity, ChildResource, ErrorKind, ObjectKey, OwnerRef, ParentResource, ResourceKind, Result, ScopeTable};
}

fn str_field<'a>(v: &'a Json, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn string_map(v: &Json) -> BTreeMap<String, String> {
    v.as_object()
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

/// Coerce `v` into an object (replacing any non-object) and borrow the map.
fn object_mut(v: &mut Json) -> &mut Map<String, Json> {
    if !v.is_object() {
        *v = Json::Object(Map::new());
    }
    match v {
        Json::Object(m) => m,
        _ => unreachable!("value was just made an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parent() -> ParentResource {
        ParentResource::from_object(&json!({
            "apiVersion": "stacks.brood.dev/v1alpha1",
            "kind": "Stack",
            "metadata": { "name": "shop", "namespace": "prod", "uid": "2b7e0c53-2f3c-4f59-9d1e-8a4b6c1d2e3f", "generation": 4, "labels": { "team": "web" } },
            "spec": { "replicas": 3 }
        }))
        .unwrap()
    }

    #[test]
    fn parse_gvk_keys() {
        assert_eq!(ResourceKind::parse("v1/ConfigMap").unwrap(), ResourceKind::new("", "v1", "ConfigMap"));
        assert_eq!(ResourceKind::parse("apps/v1/Deployment").unwrap().api_version(), "apps/v1");
        assert!(ResourceKind::parse("Deployment").is_err());
        assert!(ResourceKind::parse("a/b/c/d").is_err());
        assert_eq!(ResourceKind::from_api_version("v1", "Service").gvk_key(), "v1/Service");
    }

    #[test]
    fn parent_from_object_reads_metadata() {
        let p = parent();
        assert_eq!(p.kind.gvk_key(), "stacks.brood.dev/v1alpha1/Stack");
        assert_eq!(p.key.to_string(), "prod/shop");
        assert_eq!(p.generation, 4);
        assert_eq!(p.labels.get("team").map(String::as_str), Some("web"));
        assert_eq!(p.spec["replicas"], 3);
        let owner = p.owner_ref().unwrap();
        assert_eq!(owner.api_version, "stacks.brood.dev/v1alpha1");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn parent_errors_are_friendly() {
        let e = ParentResource::from_object(&json!({ "kind": "Stack", "metadata": { "name": "x" } })).unwrap_err().to_string();
        assert!(e.contains("missing apiVersion"), "e={}", e);
        let e = ParentResource::from_object(&json!({ "apiVersion": "v1", "kind": "Stack", "metadata": {} })).unwrap_err().to_string();
        assert!(e.contains("missing metadata.name"), "e={}", e);
    }

    #[test]
    fn manifest_forces_identity_fields() {
        let mut c = ChildResource::from_manifest(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "a" },
            "data": { "k": "v" }
        }))
        .unwrap();
        c.key.name = "renamed".into();
        c.set_namespace(None);
        let m = c.manifest();
        assert_eq!(m["metadata"]["name"], "renamed");
        assert!(m["metadata"].get("namespace").is_none());
        assert_eq!(m["data"]["k"], "v");
    }

    #[test]
    fn non_object_body_is_normalized() {
        let c = ChildResource::new(ResourceKind::new("", "v1", "ConfigMap"), ObjectKey::new(Some("ns"), "x"), json!("oops"));
        assert!(c.body.is_object());
        assert_eq!(c.manifest()["kind"], "ConfigMap");
    }

    #[test]
    fn labels_and_annotations_round_trip_through_body() {
        let mut c = ChildResource::new(ResourceKind::new("", "v1", "ConfigMap"), ObjectKey::new(Some("ns"), "x"), json!({}));
        c.set_label("a", "1");
        c.set_annotation("note", "hi");
        assert_eq!(c.label("a"), Some("1"));
        assert_eq!(c.annotation("note"), Some("hi"));
        assert_eq!(c.labels().len(), 1);
    }

    #[test]
    fn controller_owner_reference_replaces_previous_controller() {
        let p = parent();
        let mut c = ChildResource::new(ResourceKind::new("", "v1", "ConfigMap"), ObjectKey::new(Some("prod"), "x"), json!({}));
        c.set_owner_reference(OwnerRef {
            api_version: "v1".into(),
            kind: "Other".into(),
            name: "old".into(),
            uid: "old-uid".into(),
            controller: Some(true),
            block_owner_deletion: None,
        });
        c.set_owner_reference(p.owner_ref().unwrap());
        c.set_owner_reference(p.owner_ref().unwrap());
        let refs = c.owner_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "shop");
    }

    #[test]
    fn identity_for_role_uses_parent_namespace_unless_cluster_scoped() {
        let p = parent();
        let scopes = ScopeTable::default();
        let id = ChildIdentity::for_role(&p, ResourceKind::new("apps", "v1", "Deployment"), "web", &scopes).unwrap();
        assert_eq!(id.key, ObjectKey::new(Some("prod"), "shop-web"));
        let id = ChildIdentity::for_role(&p, ResourceKind::new("rbac.authorization.k8s.io", "v1", "ClusterRole"), "reader", &scopes).unwrap();
        assert_eq!(id.key.namespace, None);
        assert_eq!(id.to_string(), "rbac.authorization.k8s.io/v1/ClusterRole shop-reader");
    }

    #[test]
    fn object_ref_ignores_version() {
        let key = ObjectKey::new(Some("prod"), "shop-hpa");
        let v1 = ChildIdentity { kind: ResourceKind::new("autoscaling", "v1", "HorizontalPodAutoscaler"), key: key.clone() };
        let v2 = ChildIdentity { kind: ResourceKind::new("autoscaling", "v2", "HorizontalPodAutoscaler"), key };
        assert_ne!(v1, v2);
        assert_eq!(v1.object_ref(), v2.object_ref());
    }

    #[test]
    fn empty_namespace_declares_cluster_scope() {
        let kind = ResourceKind::new("example.dev", "v1", "Tenant");
        let c = ChildResource::new(kind.clone(), ObjectKey::new(None, "t"), json!({ "metadata": { "namespace": "" } }));
        assert!(c.declares_cluster_scope());
        let c = ChildResource::new(kind.clone(), ObjectKey::new(None, "t"), json!({ "metadata": { "namespace": "prod" } }));
        assert!(!c.declares_cluster_scope());
        assert!(!ChildResource::new(kind, ObjectKey::new(None, "t"), json!({})).declares_cluster_scope());
    }
}
