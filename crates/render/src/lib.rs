//! Brood render: derive desired children from a parent.
//!
//! A [`Generator`] is a pure function of the parent. It never looks at the
//! cluster, so two calls with equal parents return equal children.

#![forbid(unsafe_code)]

use brood_core::labels;
use brood_core::prelude::*;
use brood_core::{ensure_unique, is_dns1123_label};
use serde_json::Value as Json;
use tracing::debug;

/// Produces the ordered list of children a parent currently wants.
pub trait Generator: Send + Sync {
    fn generate(&self, parent: &ParentResource) -> Result<Vec<ChildResource>>;
}

/// Plain functions and closures are generators.
impl<F> Generator for F
where
    F: Fn(&ParentResource) -> Result<Vec<ChildResource>> + Send + Sync,
{
    fn generate(&self, parent: &ParentResource) -> Result<Vec<ChildResource>> {
        self(parent)
    }
}

/// Run `generator` and reject output that repeats an identity.
pub fn generate_checked<G: Generator + ?Sized>(generator: &G, parent: &ParentResource) -> Result<Vec<ChildResource>> {
    let children = generator.generate(parent)?;
    ensure_unique(&children)?;
    debug!(parent = %parent.key, count = children.len(), "generated children");
    Ok(children)
}

/// Generator for parents that embed their children's manifests.
///
/// Reads `spec.<field>` as a list of `{ role, manifest }` entries. Each
/// manifest needs `apiVersion` and `kind`; its name is always derived from the
/// parent name and the role, and its namespace is the parent's unless the kind
/// is cluster-scoped or the manifest sets `metadata.namespace: ""`. A missing
/// or null field means no children.
#[derive(Debug, Clone)]
pub struct EmbeddedGenerator {
    field: String,
    scopes: ScopeTable,
}

impl Default for EmbeddedGenerator {
    fn default() -> Self {
        Self { field: "resources".to_string(), scopes: ScopeTable::default() }
    }
}

impl EmbeddedGenerator {
    pub fn new() -> Self { Self::default() }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn with_scopes(mut self, scopes: ScopeTable) -> Self {
        self.scopes = scopes;
        self
    }

    fn child_from_entry(&self, parent: &ParentResource, idx: usize, entry: &Json) -> Result<ChildResource> {
        let at = |what: &str| BroodError::Generation(format!("spec.{}[{}]: {}", self.field, idx, what));
        let role = entry.get("role").and_then(|v| v.as_str()).ok_or_else(|| at("missing role"))?;
        if !is_dns1123_label(role) {
            return Err(at(&format!("role {:?} must be a lowercase DNS-1123 label", role)));
        }
        let manifest = entry.get("manifest").filter(|v| v.is_object()).ok_or_else(|| at("manifest must be an object"))?;
        let api_version = manifest.get("apiVersion").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).ok_or_else(|| at("manifest missing apiVersion"))?;
        let kind = manifest.get("kind").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).ok_or_else(|| at("manifest missing kind"))?;
        let kind = ResourceKind::from_api_version(api_version, kind);
        let mut identity = ChildIdentity::for_role(parent, kind, role, &self.scopes).map_err(|e| at(&e.to_string()))?;
        // An explicit empty namespace marks a cluster-scoped kind the scope table does not know.
        if manifest.pointer("/metadata/namespace").and_then(|v| v.as_str()) == Some("") {
            identity.key.namespace = None;
        }
        let mut child = ChildResource::new(identity.kind, identity.key, manifest.clone());
        child.set_label(labels::ROLE, role);
        Ok(child)
    }
}

impl Generator for EmbeddedGenerator {
    fn generate(&self, parent: &ParentResource) -> Result<Vec<ChildResource>> {
        let entries = match parent.spec.get(&self.field) {
            None | Some(Json::Null) => return Ok(Vec::new()),
            Some(Json::Array(entries)) => entries,
            Some(_) => return Err(BroodError::Generation(format!("spec.{} must be a list", self.field))),
        };
        entries.iter().enumerate().map(|(i, e)| self.child_from_entry(parent, i, e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parent(spec: Json) -> ParentResource {
        ParentResource::from_object(&json!({
            "apiVersion": "stacks.brood.dev/v1",
            "kind": "Stack",
            "metadata": { "name": "shop", "namespace": "prod", "uid": "0f0e0d0c-0b0a-4908-8706-050403020100" },
            "spec": spec
        }))
        .unwrap()
    }

    fn web_and_config(replicas: u32) -> Json {
        json!({
            "resources": [
                { "role": "web", "manifest": { "apiVersion": "apps/v1", "kind": "Deployment", "spec": { "replicas": replicas } } },
                { "role": "config", "manifest": { "apiVersion": "v1", "kind": "ConfigMap", "data": { "mode": "prod" } } },
                { "role": "reader", "manifest": { "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "rules": [] } }
            ]
        })
    }

    #[test]
    fn generation_is_deterministic() {
        let p = parent(web_and_config(2));
        let g = EmbeddedGenerator::new();
        let a = g.generate(&p).unwrap();
        let b = g.generate(&p).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn identity_depends_on_parent_and_role_only() {
        let g = EmbeddedGenerator::new();
        let a: Vec<_> = g.generate(&parent(web_and_config(1))).unwrap().iter().map(|c| c.identity()).collect();
        let b: Vec<_> = g.generate(&parent(web_and_config(9))).unwrap().iter().map(|c| c.identity()).collect();
        assert_eq!(a, b);
        assert_eq!(a[0].key, ObjectKey::new(Some("prod"), "shop-web"));
        assert_eq!(a[1].key, ObjectKey::new(Some("prod"), "shop-config"));
        assert_eq!(a[2].key, ObjectKey::new(None, "shop-reader"));
    }

    #[test]
    fn manifest_name_is_overridden_and_role_labelled() {
        let p = parent(json!({ "resources": [
            { "role": "web", "manifest": { "apiVersion": "v1", "kind": "Service", "metadata": { "name": "whatever" } } }
        ] }));
        let children = EmbeddedGenerator::new().generate(&p).unwrap();
        assert_eq!(children[0].manifest()["metadata"]["name"], "shop-web");
        assert_eq!(children[0].label(labels::ROLE), Some("web"));
    }

    #[test]
    fn empty_namespace_or_scope_table_makes_a_child_cluster_scoped() {
        let tenant = |ns: Json| json!({ "resources": [
            { "role": "tenant", "manifest": { "apiVersion": "tenancy.example.dev/v1", "kind": "Tenant", "metadata": { "namespace": ns } } }
        ] });
        let out = EmbeddedGenerator::new().generate(&parent(tenant(json!("")))).unwrap();
        assert_eq!(out[0].key, ObjectKey::new(None, "shop-tenant"));
        assert!(out[0].declares_cluster_scope());
        assert!(out[0].manifest()["metadata"].get("namespace").is_none());

        // Without the marker an unknown kind lands in the parent namespace...
        let out = EmbeddedGenerator::new().generate(&parent(tenant(Json::Null))).unwrap();
        assert_eq!(out[0].key.namespace.as_deref(), Some("prod"));
        // ...unless the scope table is told about it.
        let scopes = ScopeTable::default().with_kinds([&ResourceKind::new("tenancy.example.dev", "v1", "Tenant")]);
        let out = EmbeddedGenerator::new().with_scopes(scopes).generate(&parent(tenant(Json::Null))).unwrap();
        assert_eq!(out[0].key.namespace, None);
    }

    #[test]
    fn missing_field_means_no_children() {
        assert!(EmbeddedGenerator::new().generate(&parent(json!({}))).unwrap().is_empty());
        assert!(EmbeddedGenerator::new().generate(&parent(json!({ "resources": null }))).unwrap().is_empty());
        assert!(EmbeddedGenerator::new().generate(&parent(json!({ "resources": [] }))).unwrap().is_empty());
    }

    #[test]
    fn malformed_payload_is_a_generation_error() {
        let cases = [
            json!({ "resources": "nope" }),
            json!({ "resources": [ { "manifest": { "apiVersion": "v1", "kind": "ConfigMap" } } ] }),
            json!({ "resources": [ { "role": "Bad Role", "manifest": { "apiVersion": "v1", "kind": "ConfigMap" } } ] }),
            json!({ "resources": [ { "role": "a", "manifest": { "kind": "ConfigMap" } } ] }),
            json!({ "resources": [ { "role": "a", "manifest": [] } ] }),
        ];
        for spec in cases {
            let err = EmbeddedGenerator::new().generate(&parent(spec.clone())).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Generation, "spec={} err={}", spec, err);
        }
    }

    #[test]
    fn custom_field_is_honoured() {
        let p = parent(json!({ "children": [ { "role": "a", "manifest": { "apiVersion": "v1", "kind": "ConfigMap" } } ] }));
        assert_eq!(EmbeddedGenerator::new().with_field("children").generate(&p).unwrap().len(), 1);
        assert!(EmbeddedGenerator::new().generate(&p).unwrap().is_empty());
    }

    #[test]
    fn checked_generation_rejects_duplicate_identities() {
        let p = parent(json!({ "resources": [
            { "role": "a", "manifest": { "apiVersion": "v1", "kind": "ConfigMap" } },
            { "role": "a", "manifest": { "apiVersion": "v1", "kind": "ConfigMap", "data": { "x": "y" } } }
        ] }));
        let err = generate_checked(&EmbeddedGenerator::new(), &p).unwrap_err();
        assert!(matches!(err, BroodError::DuplicateIdentity(_)));
        // Same role, different kinds: distinct identities.
        let p = parent(json!({ "resources": [
            { "role": "a", "manifest": { "apiVersion": "v1", "kind": "ConfigMap" } },
            { "role": "a", "manifest": { "apiVersion": "v1", "kind": "Secret" } }
        ] }));
        assert_eq!(generate_checked(&EmbeddedGenerator::new(), &p).unwrap().len(), 2);
    }

    #[test]
    fn closures_are_generators() {
        let g = |p: &ParentResource| -> Result<Vec<ChildResource>> {
            let kind = ResourceKind::new("", "v1", "ConfigMap");
            let id = ChildIdentity::for_role(p, kind, "settings", &ScopeTable::default())?;
            Ok(vec![ChildResource::new(id.kind, id.key, json!({ "data": {} }))])
        };
        let out = generate_checked(&g, &parent(json!({}))).unwrap();
        assert_eq!(out[0].key.name, "shop-settings");
        let boxed: Box<dyn Generator> = Box::new(g);
        assert_eq!(boxed.generate(&parent(json!({}))).unwrap(), out);
    }
}
