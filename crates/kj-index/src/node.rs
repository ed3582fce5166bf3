use std::collections::BTreeMap;

use kj_types::Record;

/// One level of the chunked-key trie.
///
/// The terminal record and the child branches are separate fields, so a key
/// that is a chunk-prefix of another (`"12"` and `"1234"`) keeps both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyNode {
    record: Option<Record>,
    children: BTreeMap<String, KeyNode>,
}

impl KeyNode {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` at `chunks`, replacing any previous record there.
    /// Returns `true` when the key was not present before.
    pub fn insert(&mut self, chunks: &[String], record: Record) -> bool {
        let mut node = self;
        for chunk in chunks {
            node = node.children.entry(chunk.clone()).or_default();
        }
        node.record.replace(record).is_none()
    }

    #[must_use]
    pub fn get(&self, chunks: &[String]) -> Option<&Record> {
        let mut node = self;
        for chunk in chunks {
            node = node.children.get(chunk)?;
        }
        node.record.as_ref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record.is_none() && self.children.is_empty()
    }

    /// Number of terminal records below and including this node.
    #[must_use]
    pub fn key_count(&self) -> usize {
        let own = usize::from(self.record.is_some());
        own + self.children.values().map(Self::key_count).sum::<usize>()
    }

    /// Folds `other` into `self`; records from `other` win. Returns the number
    /// of keys that were new to `self`.
    pub fn merge(&mut self, other: KeyNode) -> usize {
        let mut added = 0;
        if let Some(record) = other.record {
            if self.record.replace(record).is_none() {
                added += 1;
            }
        }
        for (chunk, child) in other.children {
            added += self.children.entry(chunk).or_default().merge(child);
        }
        added
    }

    /// Every `(chunk path, record)` pair in depth-first, chunk-sorted order.
    #[must_use]
    pub fn entries(&self) -> Vec<(Vec<String>, &Record)> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.collect_entries(&mut path, &mut out);
        out
    }

    fn collect_entries<'a>(&'a self, path: &mut Vec<String>, out: &mut Vec<(Vec<String>, &'a Record)>) {
        if let Some(record) = &self.record {
            out.push((path.clone(), record));
        }
        for (chunk, child) in &self.children {
            path.push(chunk.clone());
            child.collect_entries(path, out);
            path.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use kj_types::Record;

    use super::KeyNode;
    use crate::decompose_key;

    fn record(value: &str) -> Record {
        Record::new(vec![value.to_owned()])
    }

    #[test]
    fn prefix_keys_coexist() {
        let mut root = KeyNode::new();
        assert!(root.insert(&decompose_key("12"), record("short")));
        assert!(root.insert(&decompose_key("1234"), record("long")));

        assert_eq!(root.get(&decompose_key("12")), Some(&record("short")));
        assert_eq!(root.get(&decompose_key("1234")), Some(&record("long")));
        assert_eq!(root.get(&decompose_key("123")), None);
        assert_eq!(root.key_count(), 2);
    }

    #[test]
    fn reinsert_overwrites_and_is_not_counted_as_new() {
        let mut root = KeyNode::new();
        assert!(root.insert(&decompose_key("ab"), record("first")));
        assert!(!root.insert(&decompose_key("ab"), record("second")));
        assert_eq!(root.get(&decompose_key("ab")), Some(&record("second")));
    }

    #[test]
    fn branch_without_record_is_a_miss() {
        let mut root = KeyNode::new();
        root.insert(&decompose_key("abcd"), record("x"));
        assert_eq!(root.get(&decompose_key("ab")), None);
    }

    #[test]
    fn merge_prefers_incoming_records() {
        let mut left = KeyNode::new();
        left.insert(&decompose_key("1001"), record("old"));
        left.insert(&decompose_key("1002"), record("keep"));

        let mut right = KeyNode::new();
        right.insert(&decompose_key("1001"), record("new"));
        right.insert(&decompose_key("2001"), record("added"));

        assert_eq!(left.merge(right), 1);
        assert_eq!(left.get(&decompose_key("1001")), Some(&record("new")));
        assert_eq!(left.get(&decompose_key("1002")), Some(&record("keep")));
        assert_eq!(left.get(&decompose_key("2001")), Some(&record("added")));
    }

    #[test]
    fn entries_walk_in_sorted_chunk_order() {
        let mut root = KeyNode::new();
        root.insert(&decompose_key("bb"), record("2"));
        root.insert(&decompose_key("aa"), record("1"));
        root.insert(&decompose_key("aacc"), record("3"));

        let paths = root
            .entries()
            .into_iter()
            .map(|(path, _)| path.join("/"))
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["aa", "aa/cc", "bb"]);
    }
}
