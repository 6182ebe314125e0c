// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tag → keys index for bulk invalidation.
//!
//! Maintained by [`ExpiringStore`](super::expiring::ExpiringStore) on every
//! write and delete. Lookup cost is proportional to the number of keys
//! carrying the tag, never to the size of the store.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct TagIndex {
    tags: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tag: &str, key: &str) {
        self.tags
            .entry(tag.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Remove `key` from each of `tags`, pruning sets that become empty.
    pub fn remove_key<'a>(&mut self, key: &str, tags: impl IntoIterator<Item = &'a String>) {
        for tag in tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    #[must_use]
    pub fn keys_for_tag(&self, tag: &str) -> Vec<String> {
        self.tags
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn contains(&self, tag: &str, key: &str) -> bool {
        self.tags.get(tag).is_some_and(|keys| keys.contains(key))
    }

    /// Number of non-empty tags
    #[must_use]
    pub fn tags_len(&self) -> usize {
        self.tags.len()
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut index = TagIndex::new();
        index.add("canton", "zh");
        index.add("canton", "be");
        index.add("postal", "8001");

        let mut keys = index.keys_for_tag("canton");
        keys.sort();
        assert_eq!(keys, vec!["be", "zh"]);
        assert_eq!(index.keys_for_tag("postal"), vec!["8001"]);
        assert!(index.keys_for_tag("unknown").is_empty());
        assert_eq!(index.tags_len(), 2);
    }

    #[test]
    fn test_remove_key_prunes_empty_tags() {
        let mut index = TagIndex::new();
        index.add("a", "k1");
        index.add("b", "k1");
        index.add("b", "k2");

        let tags = vec!["a".to_string(), "b".to_string()];
        index.remove_key("k1", &tags);

        assert!(!index.contains("a", "k1"));
        assert!(!index.contains("b", "k1"));
        assert!(index.contains("b", "k2"));
        assert_eq!(index.tags_len(), 1);
    }

    #[test]
    fn test_remove_unknown_key_is_noop() {
        let mut index = TagIndex::new();
        index.add("a", "k1");
        index.remove_key("nope", &vec!["a".to_string(), "zzz".to_string()]);
        assert!(index.contains("a", "k1"));
    }

    #[test]
    fn test_clear() {
        let mut index = TagIndex::new();
        index.add("a", "k1");
        index.clear();
        assert_eq!(index.tags_len(), 0);
    }
}
