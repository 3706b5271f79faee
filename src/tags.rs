//! Immutable, structurally shared tag sets.
//!
//! A [`TagSet`] is a persistent linked list of key/value pairs. Adding a tag
//! allocates a single node that points at its parent, so deriving a per-sample
//! set from a per-scenario set costs one allocation regardless of how many tags
//! the parent already carries. Sets are never mutated after construction and are
//! shared between samples through [`Arc`].
//!
//! Lookups walk the chain from the newest node, so a key added later shadows the
//! same key further up the chain.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Serialize, Serializer};

struct TagNode {
    key: Arc<str>,
    value: Arc<str>,
    parent: Option<Arc<TagNode>>,
}

#[derive(Clone, Default)]
pub struct TagSet {
    head: Option<Arc<TagNode>>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new set with `key` bound to `value`, sharing every existing
    /// node with `self`.
    #[must_use]
    pub fn with(&self, key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        Self {
            head: Some(Arc::new(TagNode {
                key: key.into(),
                value: value.into(),
                parent: self.head.clone(),
            })),
        }
    }

    /// Extends the set with every pair of `tags`.
    #[must_use]
    pub fn with_all<K, V>(&self, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Arc<str>>,
        V: Into<Arc<str>>,
    {
        tags.into_iter()
            .fold(self.clone(), |set, (k, v)| set.with(k, v))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.nodes()
            .find(|node| &*node.key == key)
            .map(|node| &*node.value)
    }

    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.get(key) == Some(value)
    }

    /// True when every pair of `selector` is present in `self`.
    pub fn matches(&self, selector: &TagSelector) -> bool {
        selector
            .pairs
            .iter()
            .all(|(k, v)| self.contains(k, v))
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.to_map().len()
    }

    /// Effective key/value pairs with shadowed entries removed, sorted by key.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for node in self.nodes() {
            map.entry(node.key.to_string())
                .or_insert_with(|| node.value.to_string());
        }
        map
    }

    fn nodes(&self) -> impl Iterator<Item = &TagNode> {
        std::iter::successors(self.head.as_deref(), |node| node.parent.as_deref())
    }
}

impl<K, V> FromIterator<(K, V)> for TagSet
where
    K: Into<Arc<str>>,
    V: Into<Arc<str>>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        TagSet::new().with_all(iter)
    }
}

impl PartialEq for TagSet {
    fn eq(&self, other: &Self) -> bool {
        match (&self.head, &other.head) {
            (Some(a), Some(b)) if Arc::ptr_eq(a, b) => true,
            _ => self.to_map() == other.to_map(),
        }
    }
}

impl Eq for TagSet {}

impl fmt::Debug for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.to_map()).finish()
    }
}

/// The distinct pairs of a [`TagSet`], resolved once so matching a sample
/// against it allocates nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSelector {
    pairs: Box<[(Arc<str>, Arc<str>)]>,
}

impl TagSelector {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl From<&TagSet> for TagSelector {
    fn from(set: &TagSet) -> Self {
        let mut pairs: Vec<(Arc<str>, Arc<str>)> = Vec::new();
        for node in set.nodes() {
            if !pairs.iter().any(|(k, _)| *k == node.key) {
                pairs.push((Arc::clone(&node.key), Arc::clone(&node.value)));
            }
        }
        Self {
            pairs: pairs.into_boxed_slice(),
        }
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .to_map()
            .into_iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect();
        write!(f, "{{{}}}", pairs.join(","))
    }
}

impl Serialize for TagSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_shares_parent_nodes() {
        let base = TagSet::new().with("scenario", "default").with("group", "");
        let child = base.with("status", "200");

        let parent = child.head.as_ref().and_then(|n| n.parent.clone());
        assert!(Arc::ptr_eq(
            parent.as_ref().unwrap(),
            base.head.as_ref().unwrap()
        ));
        // the parent is untouched
        assert_eq!(base.get("status"), None);
        assert_eq!(child.get("scenario"), Some("default"));
    }

    #[test]
    fn newer_values_shadow_older_ones() {
        let tags = TagSet::new().with("method", "GET").with("method", "POST");
        assert_eq!(tags.get("method"), Some("POST"));
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.to_map().get("method").map(String::as_str), Some("POST"));
    }

    #[test]
    fn selector_matching() {
        let tags: TagSet = [("status", "200"), ("method", "GET")].into_iter().collect();
        let selector: TagSet = [("status", "200")].into_iter().collect();
        let other: TagSet = [("status", "500")].into_iter().collect();

        assert!(tags.matches(&TagSelector::from(&selector)));
        assert!(!tags.matches(&TagSelector::from(&other)));
        assert!(tags.matches(&TagSelector::default()));
    }

    #[test]
    fn selectors_keep_the_newest_value_per_key() {
        let set = TagSet::new()
            .with("status", "500")
            .with("method", "GET")
            .with("status", "200");
        let selector = TagSelector::from(&set);
        assert_eq!(selector.len(), 2);

        let ok = TagSet::new().with("status", "200").with("method", "GET");
        let failed = TagSet::new().with("status", "500").with("method", "GET");
        assert!(ok.matches(&selector));
        assert!(!failed.matches(&selector));
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let a: TagSet = [("a", "1"), ("b", "2")].into_iter().collect();
        let b: TagSet = [("b", "2"), ("a", "1")].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "{a:1,b:2}");
    }

    #[test]
    fn serializes_as_a_flat_map() {
        let tags: TagSet = [("scenario", "api")].into_iter().collect();
        let json = serde_json::to_string(&tags).unwrap();
        assert_eq!(json, r#"{"scenario":"api"}"#);
    }
}
