use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;

use crate::{BroodError, ChildResource, Result};

/// Longest name accepted for label values and most resource names.
pub const MAX_NAME_LEN: usize = 63;

static DNS1123_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

pub fn is_dns1123_label(s: &str) -> bool {
    s.len() <= MAX_NAME_LEN && DNS1123_LABEL.is_match(s)
}

/// Name of the child playing `role` for the parent named `parent_name`.
///
/// Pure function of its inputs. Characters outside `[a-z0-9-]` become `-`;
/// names longer than [`MAX_NAME_LEN`] are cut and suffixed with a hash of the
/// full name so distinct roles keep distinct names.
pub fn child_name(parent_name: &str, role: &str) -> Result<String> {
    let role = sanitize(role);
    if role.is_empty() {
        return Err(BroodError::InvalidObject("child role must not be empty".into()));
    }
    let parent = sanitize(parent_name);
    let full = if parent.is_empty() { role } else { format!("{}-{}", parent, role) };
    let name = if full.len() > MAX_NAME_LEN {
        let hash = format!("{:08x}", fnv1a(full.as_bytes()) as u32);
        let head = full[..MAX_NAME_LEN - hash.len() - 1].trim_end_matches('-');
        format!("{}-{}", head, hash)
    } else {
        full
    };
    if !is_dns1123_label(&name) {
        return Err(BroodError::InvalidObject(format!("derived child name {:?} is not a DNS-1123 label", name)));
    }
    Ok(name)
}

/// Fail on the first identity that appears twice.
pub fn ensure_unique(children: &[ChildResource]) -> Result<()> {
    let mut seen = FxHashSet::default();
    for c in children {
        let id = c.identity();
        if !seen.insert((c.kind.group.as_str(), c.kind.kind.as_str(), &c.key)) {
            return Err(BroodError::DuplicateIdentity(id));
        }
    }
    Ok(())
}

fn sanitize(s: &str) -> String {
    let mapped: String = s
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' }
        })
        .collect();
    mapped.trim_matches('-').to_string()
}

pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectKey, ResourceKind};

    #[test]
    fn names_are_deterministic_and_sanitized() {
        assert_eq!(child_name("shop", "web").unwrap(), "shop-web");
        assert_eq!(child_name("Shop", "Web_Config").unwrap(), "shop-web-config");
        assert_eq!(child_name("shop", "web").unwrap(), child_name("shop", "web").unwrap());
    }

    #[test]
    fn empty_role_is_rejected() {
        assert!(child_name("shop", "").is_err());
        assert!(child_name("shop", "__").is_err());
    }

    #[test]
    fn long_names_are_truncated_with_stable_hash() {
        let parent = "a".repeat(60);
        let a = child_name(&parent, "database").unwrap();
        let b = child_name(&parent, "cache").unwrap();
        assert!(a.len() <= MAX_NAME_LEN, "{}", a);
        assert!(is_dns1123_label(&a));
        assert_ne!(a, b);
        assert_eq!(a, child_name(&parent, "database").unwrap());
    }

    #[test]
    fn duplicate_identities_are_detected() {
        let kind = ResourceKind::new("", "v1", "ConfigMap");
        let mk = |n: &str| ChildResource::new(kind.clone(), ObjectKey::new(Some("ns"), n), serde_json::json!({}));
        assert!(ensure_unique(&[mk("a"), mk("b")]).is_ok());
        let err = ensure_unique(&[mk("a"), mk("b"), mk("a")]).unwrap_err();
        assert!(matches!(err, BroodError::DuplicateIdentity(id) if id.key.name == "a"));
    }

    #[test]
    fn two_versions_of_one_object_are_duplicates() {
        let key = ObjectKey::new(Some("prod"), "shop-hpa");
        let v1 = ChildResource::new(ResourceKind::new("autoscaling", "v1", "HorizontalPodAutoscaler"), key.clone(), serde_json::json!({}));
        let v2 = ChildResource::new(ResourceKind::new("autoscaling", "v2", "HorizontalPodAutoscaler"), key, serde_json::json!({}));
        assert!(ensure_unique(&[v1, v2]).is_err());
    }
}
