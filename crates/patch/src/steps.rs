//! Built-in mutation steps.

use brood_core::labels;
use brood_core::prelude::*;
use brood_core::ensure_unique;
use serde::Deserialize;
use serde_json::Value as Json;
use uuid::Uuid;

use crate::{merge_patch, Patcher};

/// Puts namespace-less children into the parent's namespace.
///
/// Kinds the scope table marks cluster-scoped, and children whose manifest
/// sets `metadata.namespace: ""`, stay without a namespace.
#[derive(Debug, Clone, Default)]
pub struct NamespaceDefaulter {
    scopes: ScopeTable,
}

impl NamespaceDefaulter {
    pub fn new(scopes: ScopeTable) -> Self { Self { scopes } }
}

impl Patcher for NamespaceDefaulter {
    fn name(&self) -> &str { "namespace-defaulter" }

    fn patch(&self, parent: &ParentResource, mut children: Vec<ChildResource>) -> Result<Vec<ChildResource>> {
        for c in children.iter_mut() {
            if c.key.namespace.is_none() && !c.declares_cluster_scope() && !self.scopes.is_cluster_scoped(&c.kind) {
                c.set_namespace(parent.key.namespace.clone());
            }
        }
        Ok(children)
    }
}

/// Stamps the labels used to find a parent's children in later cycles.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerLabels;

impl Patcher for OwnerLabels {
    fn name(&self) -> &str { "owner-labels" }

    fn patch(&self, parent: &ParentResource, mut children: Vec<ChildResource>) -> Result<Vec<ChildResource>> {
        let stamp = labels::ownership_labels(parent);
        for c in children.iter_mut() {
            for (k, v) in &stamp {
                c.set_label(k, v);
            }
        }
        Ok(children)
    }
}

/// Records which parent generation produced each child.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationAnnotation;

impl Patcher for GenerationAnnotation {
    fn name(&self) -> &str { "generation-annotation" }

    fn patch(&self, parent: &ParentResource, mut children: Vec<ChildResource>) -> Result<Vec<ChildResource>> {
        let generation = parent.generation.to_string();
        for c in children.iter_mut() {
            c.set_annotation(labels::PARENT_GENERATION, &generation);
        }
        Ok(children)
    }
}

/// Makes the parent the controller owner of its children.
///
/// Namespaced owners can only own objects in their own namespace, so other
/// children are left alone and are tracked by labels only.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerReferenceSetter;

impl Patcher for OwnerReferenceSetter {
    fn name(&self) -> &str { "owner-reference" }

    fn patch(&self, parent: &ParentResource, mut children: Vec<ChildResource>) -> Result<Vec<ChildResource>> {
        let owner = parent.owner_ref().ok_or_else(|| BroodError::mutation(self.name(), "parent has no metadata.uid"))?;
        Uuid::parse_str(&owner.uid).map_err(|e| BroodError::mutation(self.name(), format!("parent uid {:?}: {}", owner.uid, e)))?;
        for c in children.iter_mut() {
            if parent.key.namespace.is_none() || c.key.namespace == parent.key.namespace {
                c.set_owner_reference(owner.clone());
            }
        }
        Ok(children)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Override {
    #[serde(default)]
    api_version: Option<String>,
    kind: String,
    name: String,
    /// `""` selects a cluster-scoped child.
    #[serde(default)]
    namespace: Option<String>,
    patch: Json,
}

impl Override {
    fn matches(&self, c: &ChildResource) -> bool {
        c.kind.kind == self.kind
            && c.key.name == self.name
            && self.api_version.as_deref().map_or(true, |av| av == c.kind.api_version())
            && self.namespace.as_deref().map_or(true, |ns| c.key.namespace.as_deref().unwrap_or("") == ns)
    }
}

/// Merges user overrides from the parent's spec onto generated children.
///
/// `spec.<field>` is a list of `{ apiVersion?, kind, name, namespace?, patch }`.
/// Each `patch` is a JSON merge patch (RFC 7386) applied to the matching
/// child's body. Overrides cannot rename or move a child. An override must
/// match exactly one child: none is an error, and so is more than one, which
/// happens when the same kind and name exist in several namespaces.
#[derive(Debug, Clone)]
pub struct OverrideMerger {
    field: String,
}

impl Default for OverrideMerger {
    fn default() -> Self { Self { field: "overrides".to_string() } }
}

impl OverrideMerger {
    pub fn with_field(field: impl Into<String>) -> Self { Self { field: field.into() } }

    fn overrides(&self, parent: &ParentResource) -> Result<Vec<Override>> {
        match parent.spec.get(&self.field) {
            None | Some(Json::Null) => Ok(Vec::new()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| BroodError::mutation(self.name(), format!("spec.{}: {}", self.field, e))),
        }
    }
}

fn touches_identity(patch: &Json) -> bool {
    let Some(obj) = patch.as_object() else { return true };
    if obj.contains_key("apiVersion") || obj.contains_key("kind") {
        return true;
    }
    match obj.get("metadata") {
        Some(Json::Object(meta)) => meta.contains_key("name") || meta.contains_key("namespace"),
        Some(_) => true,
        None => false,
    }
}

impl Patcher for OverrideMerger {
    fn name(&self) -> &str { "override-merger" }

    fn patch(&self, parent: &ParentResource, mut children: Vec<ChildResource>) -> Result<Vec<ChildResource>> {
        for ov in self.overrides(parent)? {
            if touches_identity(&ov.patch) {
                return Err(BroodError::mutation(self.name(), format!("override for {} {} must be an object that leaves apiVersion, kind, name and namespace alone", ov.kind, ov.name)));
            }
            let mut targets = children.iter_mut().filter(|c| ov.matches(c));
            match (targets.next(), targets.next()) {
                (Some(c), None) => merge_patch(&mut c.body, &ov.patch),
                (None, _) => return Err(BroodError::mutation(self.name(), format!("override targets unknown child {} {}", ov.kind, ov.name))),
                (Some(_), Some(_)) => {
                    return Err(BroodError::mutation(self.name(), format!("override for {} {} matches several children; set namespace", ov.kind, ov.name)))
                }
            }
        }
        Ok(children)
    }
}

/// Rejects lists where two children share an identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueIdentities;

impl Patcher for UniqueIdentities {
    fn name(&self) -> &str { "unique-identities" }

    fn patch(&self, _parent: &ParentResource, children: Vec<ChildResource>) -> Result<Vec<ChildResource>> {
        ensure_unique(&children)?;
        Ok(children)
    }
}
