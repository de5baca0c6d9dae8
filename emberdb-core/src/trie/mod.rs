//! LOUDS succinct trie for tag-value indexes
//!
//! Nodes are numbered in level order. The louds vector holds each node's
//! degree in unary (`1^deg 0`), labels carry one byte per edge in the same
//! order, and a per-node key vector marks nodes where a stored key ends.
//! Lookups and iteration run on rank/select over these vectors; the whole
//! structure serialises to a flat byte block.

mod bitvector;

pub use bitvector::BitVector;

use crate::{EmberError, Result};
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;

/// Builder collecting `(key, value)` pairs for one immutable trie
#[derive(Debug, Default)]
pub struct TrieBuilder {
    pairs: Vec<(Vec<u8>, u32)>,
}

impl TrieBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one key/value pair; duplicate keys keep the last value
    pub fn add(&mut self, key: &[u8], value: u32) {
        self.pairs.push((key.to_vec(), value));
    }

    /// Number of pairs added
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Check if no pair was added
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Build the succinct trie
    pub fn build(mut self) -> SuccinctTrie {
        self.pairs.sort_by(|a, b| a.0.cmp(&b.0));
        self.pairs.dedup_by(|a, b| {
            if a.0 == b.0 {
                // keep the later value
                b.1 = a.1;
                true
            } else {
                false
            }
        });

        // explicit tree first, then level-order emission
        let mut nodes: Vec<TreeNode> = vec![TreeNode::default()];
        for (key, value) in &self.pairs {
            let mut current = 0usize;
            for byte in key {
                let existing = nodes[current].children.get(byte).copied();
                current = match existing {
                    Some(child) => child,
                    None => {
                        let child = nodes.len();
                        nodes.push(TreeNode::default());
                        nodes[current].children.insert(*byte, child);
                        child
                    }
                };
            }
            nodes[current].value = Some(*value);
        }

        let mut louds = BitVector::new();
        let mut is_key = BitVector::new();
        let mut labels = Vec::new();
        let mut values = Vec::new();

        let mut queue: std::collections::VecDeque<usize> = [0].into();
        while let Some(node) = queue.pop_front() {
            let node = &nodes[node];
            for (label, child) in &node.children {
                louds.push(true);
                labels.push(*label);
                queue.push_back(*child);
            }
            louds.push(false);
            is_key.push(node.value.is_some());
            if let Some(value) = node.value {
                values.push(value);
            }
        }
        louds.seal();
        is_key.seal();

        SuccinctTrie {
            louds,
            labels,
            is_key,
            values,
        }
    }
}

#[derive(Debug, Default)]
struct TreeNode {
    children: BTreeMap<u8, usize>,
    value: Option<u32>,
}

/// Immutable succinct trie
#[derive(Debug, Clone)]
pub struct SuccinctTrie {
    louds: BitVector,
    labels: Vec<u8>,
    is_key: BitVector,
    values: Vec<u32>,
}

impl SuccinctTrie {
    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if no key is stored
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Point lookup
    pub fn get(&self, key: &[u8]) -> Option<u32> {
        let mut node = 0u32;
        for byte in key {
            node = self.descend(node, *byte)?;
        }
        self.node_value(node)
    }

    /// Iterate all keys in lexicographic order
    pub fn iter(&self) -> TrieIterator<'_> {
        TrieIterator {
            trie: self,
            stack: Vec::new(),
            key: Vec::new(),
            to_visit: Some(0),
        }
    }

    /// Iterate keys `>= target` in lexicographic order
    pub fn seek(&self, target: &[u8]) -> TrieIterator<'_> {
        let mut it = TrieIterator {
            trie: self,
            stack: Vec::new(),
            key: Vec::new(),
            to_visit: None,
        };

        let mut node = 0u32;
        for byte in target {
            let (start, end) = self.edge_range(node);
            match self.lower_bound(start, end, *byte) {
                None => {
                    // dead end; drop the dangling edge byte and backtrack
                    it.key.pop();
                    return it;
                }
                Some(pos) if self.labels[self.edge_index(pos)] == *byte => {
                    it.stack.push(Frame { pos: pos + 1, end });
                    it.key.push(*byte);
                    node = self.child(pos);
                }
                Some(pos) => {
                    // first larger edge; its whole subtree sorts after target
                    it.stack.push(Frame { pos, end });
                    return it;
                }
            }
        }
        it.to_visit = Some(node);
        it
    }

    /// Iterate exactly the keys with the given prefix
    pub fn prefix_iter(&self, prefix: &[u8]) -> TrieIterator<'_> {
        let mut empty = TrieIterator {
            trie: self,
            stack: Vec::new(),
            key: Vec::new(),
            to_visit: None,
        };
        let mut node = 0u32;
        for byte in prefix {
            match self.descend(node, *byte) {
                Some(child) => node = child,
                None => return empty,
            }
        }
        empty.key = prefix.to_vec();
        empty.to_visit = Some(node);
        empty
    }

    /// Serialise the trie
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.louds.marshal(&mut buf);
        buf.put_u32_le(self.labels.len() as u32);
        buf.extend_from_slice(&self.labels);
        self.is_key.marshal(&mut buf);
        buf.put_u32_le(self.values.len() as u32);
        for value in &self.values {
            buf.put_u32_le(*value);
        }
        buf
    }

    /// Parse a serialised trie
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let truncated = || EmberError::InvalidFormat("trie block truncated".into());
        let (louds, at) = BitVector::unmarshal(data)?;

        let mut cursor = std::io::Cursor::new(data);
        cursor.set_position(at as u64);
        if cursor.remaining() < 4 {
            return Err(truncated());
        }
        let label_count = cursor.get_u32_le() as usize;
        let at = cursor.position() as usize;
        let labels = data.get(at..at + label_count).ok_or_else(truncated)?.to_vec();

        let (is_key, read) = BitVector::unmarshal(&data[at + label_count..])?;
        cursor.set_position((at + label_count + read) as u64);
        if cursor.remaining() < 4 {
            return Err(truncated());
        }
        let value_count = cursor.get_u32_le() as usize;
        if cursor.remaining() < value_count * 4 {
            return Err(truncated());
        }
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            values.push(cursor.get_u32_le());
        }
        Ok(Self {
            louds,
            labels,
            is_key,
            values,
        })
    }

    /// Bit positions `[start, end)` of the node's edges
    fn edge_range(&self, node: u32) -> (usize, usize) {
        let bits = self.louds.len();
        let start = if node == 0 {
            0
        } else {
            self.louds
                .select0(node as usize - 1)
                .map(|pos| pos + 1)
                .unwrap_or(bits)
        };
        let end = self.louds.select0(node as usize).unwrap_or(bits);
        (start, end)
    }

    /// Child node reached through the edge at bit position `pos`
    fn child(&self, pos: usize) -> u32 {
        self.louds.rank1(pos) as u32
    }

    /// Index into `labels` of the edge at bit position `pos`
    fn edge_index(&self, pos: usize) -> usize {
        self.louds.rank1(pos) - 1
    }

    fn node_value(&self, node: u32) -> Option<u32> {
        if node as usize >= self.is_key.len() || !self.is_key.get(node as usize) {
            return None;
        }
        let idx = self.is_key.rank1(node as usize) - 1;
        self.values.get(idx).copied()
    }

    fn descend(&self, node: u32, byte: u8) -> Option<u32> {
        let (start, end) = self.edge_range(node);
        let pos = self.lower_bound(start, end, byte)?;
        (self.labels[self.edge_index(pos)] == byte).then(|| self.child(pos))
    }

    /// First edge position in `[start, end)` whose label is `>= byte`
    fn lower_bound(&self, start: usize, end: usize, byte: u8) -> Option<usize> {
        if start >= end {
            return None;
        }
        let base = self.edge_index(start);
        let window = &self.labels[base..base + (end - start)];
        let offset = window.partition_point(|label| *label < byte);
        (offset < window.len()).then_some(start + offset)
    }
}

struct Frame {
    pos: usize,
    end: usize,
}

/// Depth-first iterator yielding `(key, value)` in lexicographic order
pub struct TrieIterator<'a> {
    trie: &'a SuccinctTrie,
    stack: Vec<Frame>,
    key: Vec<u8>,
    to_visit: Option<u32>,
}

impl Iterator for TrieIterator<'_> {
    type Item = (Vec<u8>, u32);

    fn next(&mut self) -> Option<(Vec<u8>, u32)> {
        loop {
            if let Some(node) = self.to_visit.take() {
                let (start, end) = self.trie.edge_range(node);
                self.stack.push(Frame { pos: start, end });
                if let Some(value) = self.trie.node_value(node) {
                    return Some((self.key.clone(), value));
                }
                continue;
            }
            let frame = self.stack.last_mut()?;
            if frame.pos < frame.end {
                let pos = frame.pos;
                frame.pos += 1;
                self.key.push(self.trie.labels[self.trie.edge_index(pos)]);
                self.to_visit = Some(self.trie.child(pos));
            } else {
                self.stack.pop();
                if !self.stack.is_empty() {
                    self.key.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(pairs: &[(&str, u32)]) -> SuccinctTrie {
        let mut builder = TrieBuilder::new();
        for (key, value) in pairs {
            builder.add(key.as_bytes(), *value);
        }
        builder.build()
    }

    #[test]
    fn test_get_round_trip() {
        let pairs = [
            ("", 9),
            ("a", 1),
            ("ab", 2),
            ("abc", 3),
            ("abd", 4),
            ("b", 5),
            ("ba", 6),
            ("zzz", 7),
        ];
        let trie = build(&pairs);
        assert_eq!(trie.len(), pairs.len());
        for (key, value) in &pairs {
            assert_eq!(trie.get(key.as_bytes()), Some(*value), "key {:?}", key);
        }
        assert_eq!(trie.get(b"ac"), None);
        assert_eq!(trie.get(b"abcd"), None);
        assert_eq!(trie.get(b"z"), None);
    }

    #[test]
    fn test_iter_lexicographic() {
        let pairs = [("cab", 0), ("a", 1), ("cabin", 2), ("b", 3), ("ca", 4)];
        let trie = build(&pairs);
        let keys: Vec<String> = trie
            .iter()
            .map(|(key, _)| String::from_utf8(key).unwrap())
            .collect();
        assert_eq!(keys, vec!["a", "b", "ca", "cab", "cabin"]);
    }

    #[test]
    fn test_seek() {
        let pairs = [("apple", 0), ("banana", 1), ("cherry", 2), ("date", 3)];
        let trie = build(&pairs);

        let from_b: Vec<String> = trie
            .seek(b"b")
            .map(|(key, _)| String::from_utf8(key).unwrap())
            .collect();
        assert_eq!(from_b, vec!["banana", "cherry", "date"]);

        let from_blueberry: Vec<String> = trie
            .seek(b"blueberry")
            .map(|(key, _)| String::from_utf8(key).unwrap())
            .collect();
        assert_eq!(from_blueberry, vec!["cherry", "date"]);

        let from_exact: Vec<String> = trie
            .seek(b"cherry")
            .map(|(key, _)| String::from_utf8(key).unwrap())
            .collect();
        assert_eq!(from_exact, vec!["cherry", "date"]);

        assert_eq!(trie.seek(b"zz").count(), 0);
    }

    #[test]
    fn test_prefix_iter() {
        let pairs = [
            ("host-1", 1),
            ("host-10", 10),
            ("host-2", 2),
            ("node-1", 3),
        ];
        let trie = build(&pairs);

        let hosts: Vec<(String, u32)> = trie
            .prefix_iter(b"host-")
            .map(|(key, value)| (String::from_utf8(key).unwrap(), value))
            .collect();
        assert_eq!(
            hosts,
            vec![
                ("host-1".to_string(), 1),
                ("host-10".to_string(), 10),
                ("host-2".to_string(), 2),
            ]
        );
        assert_eq!(trie.prefix_iter(b"web-").count(), 0);
    }

    #[test]
    fn test_marshal_round_trip() {
        let pairs = [("alpha", 10), ("beta", 20), ("gamma", 30)];
        let trie = build(&pairs);
        let data = trie.marshal();
        let parsed = SuccinctTrie::unmarshal(&data).unwrap();
        for (key, value) in &pairs {
            assert_eq!(parsed.get(key.as_bytes()), Some(*value));
        }
        assert_eq!(parsed.iter().count(), pairs.len());
    }

    #[test]
    fn test_duplicate_key_keeps_last() {
        let mut builder = TrieBuilder::new();
        builder.add(b"k", 1);
        builder.add(b"k", 2);
        let trie = builder.build();
        assert_eq!(trie.len(), 1);
        assert_eq!(trie.get(b"k"), Some(2));
    }
}
