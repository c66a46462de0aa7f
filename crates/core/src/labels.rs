//! Well-known labels and annotations stamped on children.
//!
//! The ownership labels are what lets a lister find the children a parent
//! created in earlier cycles.

use std::collections::BTreeMap;

use crate::identity::fnv1a;
use crate::{ParentResource, ResourceKind, MAX_NAME_LEN};

pub const PARENT_KIND: &str = "brood.dev/parent-kind";
pub const PARENT_NAME: &str = "brood.dev/parent-name";
pub const PARENT_NAMESPACE: &str = "brood.dev/parent-namespace";
pub const PARENT_UID: &str = "brood.dev/parent-uid";
pub const ROLE: &str = "brood.dev/role";
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "brood";

pub const PARENT_GENERATION: &str = "brood.dev/parent-generation";

/// `Kind.group` (or just `Kind` for the core group).
pub fn parent_kind_value(kind: &ResourceKind) -> String {
    if kind.group.is_empty() { kind.kind.clone() } else { format!("{}.{}", kind.kind, kind.group) }
}

/// Fit `s` into a label value. Long values keep a readable head and a hash tail.
pub fn label_value(s: &str) -> String {
    if s.len() <= MAX_NAME_LEN {
        return s.to_string();
    }
    let tail = format!("{:08x}", fnv1a(s.as_bytes()) as u32);
    let mut cut = MAX_NAME_LEN - tail.len() - 1;
    while !s.is_char_boundary(cut) { cut -= 1; }
    let head = s[..cut].trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{}-{}", head, tail)
}

/// Labels identifying `parent` as the owner of a child.
pub fn ownership_labels(parent: &ParentResource) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(PARENT_KIND.to_string(), label_value(&parent_kind_value(&parent.kind)));
    out.insert(PARENT_NAME.to_string(), label_value(&parent.key.name));
    if let Some(ns) = &parent.key.namespace {
        out.insert(PARENT_NAMESPACE.to_string(), label_value(ns));
    }
    if let Some(uid) = &parent.uid {
        out.insert(PARENT_UID.to_string(), label_value(uid));
    }
    out.insert(MANAGED_BY.to_string(), MANAGER.to_string());
    out
}

/// Label selector matching the children owned by `parent`.
///
/// The uid is unique across parent re-creations, so it wins when present.
pub fn ownership_selector(parent: &ParentResource) -> String {
    if let Some(uid) = &parent.uid {
        return format!("{}={}", PARENT_UID, label_value(uid));
    }
    let mut parts = vec![
        format!("{}={}", PARENT_KIND, label_value(&parent_kind_value(&parent.kind))),
        format!("{}={}", PARENT_NAME, label_value(&parent.key.name)),
    ];
    if let Some(ns) = &parent.key.namespace {
        parts.push(format!("{}={}", PARENT_NAMESPACE, label_value(ns)));
    }
    parts.join(",")
}
