//! Trie buckets: batched succinct tries for one index key
//!
//! Rebuilding one huge trie per flush would be quadratic over time, so keys
//! are batched: each flush merges the delta with the existing tries and
//! re-emits buckets of at most `block_size` keys.

use crate::trie::{SuccinctTrie, TrieBuilder};
use crate::{EmberError, Result};
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;

/// A sequence of tries over disjoint sorted key runs
pub struct TrieBucket {
    tries: Vec<SuccinctTrie>,
}

impl TrieBucket {
    /// Empty bucket
    pub fn new() -> Self {
        Self { tries: Vec::new() }
    }

    /// Build buckets from sorted pairs, `block_size` keys per trie
    pub fn build(pairs: &BTreeMap<Vec<u8>, u32>, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        let mut tries = Vec::new();
        let mut builder = TrieBuilder::new();
        for (key, value) in pairs {
            builder.add(key, *value);
            if builder.len() >= block_size {
                tries.push(std::mem::take(&mut builder).build());
            }
        }
        if !builder.is_empty() {
            tries.push(builder.build());
        }
        Self { tries }
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.tries.iter().map(|trie| trie.len()).sum()
    }

    /// Check if no key is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point lookup across the buckets
    pub fn get(&self, key: &[u8]) -> Option<u32> {
        self.tries.iter().find_map(|trie| trie.get(key))
    }

    /// Visit every `(key, value)` pair
    pub fn scan<F>(&self, mut visit: F)
    where
        F: FnMut(&[u8], u32),
    {
        for trie in &self.tries {
            for (key, value) in trie.iter() {
                visit(&key, value);
            }
        }
    }

    /// Visit pairs whose key starts with `prefix`
    pub fn scan_prefix<F>(&self, prefix: &[u8], mut visit: F)
    where
        F: FnMut(&[u8], u32),
    {
        for trie in &self.tries {
            for (key, value) in trie.prefix_iter(prefix) {
                visit(&key, value);
            }
        }
    }

    /// All pairs as a sorted map, for merge-and-rebuild
    pub fn to_pairs(&self) -> BTreeMap<Vec<u8>, u32> {
        let mut pairs = BTreeMap::new();
        self.scan(|key, value| {
            pairs.insert(key.to_vec(), value);
        });
        pairs
    }

    /// Serialise: `[count:u32 | (len:u32 | trie bytes)*]`
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(self.tries.len() as u32);
        for trie in &self.tries {
            let data = trie.marshal();
            buf.put_u32_le(data.len() as u32);
            buf.extend_from_slice(&data);
        }
        buf
    }

    /// Parse a serialised bucket
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let truncated = || EmberError::InvalidFormat("trie bucket truncated".into());
        if data.len() < 4 {
            return Err(truncated());
        }
        let mut cursor = std::io::Cursor::new(data);
        let count = cursor.get_u32_le() as usize;
        let mut tries = Vec::with_capacity(count);
        for _ in 0..count {
            if cursor.remaining() < 4 {
                return Err(truncated());
            }
            let len = cursor.get_u32_le() as usize;
            let at = cursor.position() as usize;
            let block = data.get(at..at + len).ok_or_else(truncated)?;
            tries.push(SuccinctTrie::unmarshal(block)?);
            cursor.set_position((at + len) as u64);
        }
        Ok(Self { tries })
    }
}

impl Default for TrieBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(entries: &[(&str, u32)]) -> BTreeMap<Vec<u8>, u32> {
        entries
            .iter()
            .map(|(key, value)| (key.as_bytes().to_vec(), *value))
            .collect()
    }

    #[test]
    fn test_build_batches_by_block_size() {
        let bucket = TrieBucket::build(&pairs(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]), 3);
        assert_eq!(bucket.tries.len(), 2);
        assert_eq!(bucket.len(), 4);
        for (key, value) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            assert_eq!(bucket.get(key.as_bytes()), Some(value));
        }
        assert_eq!(bucket.get(b"e"), None);
    }

    #[test]
    fn test_marshal_round_trip() {
        let bucket = TrieBucket::build(&pairs(&[("host-1", 1), ("host-2", 2), ("web-1", 3)]), 2);
        let data = bucket.marshal();
        let parsed = TrieBucket::unmarshal(&data).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed.get(b"web-1"), Some(3));

        let mut hosts = Vec::new();
        parsed.scan_prefix(b"host-", |key, _| hosts.push(key.to_vec()));
        assert_eq!(hosts, vec![b"host-1".to_vec(), b"host-2".to_vec()]);
    }

    #[test]
    fn test_merge_via_pairs() {
        let old = TrieBucket::build(&pairs(&[("a", 1), ("b", 2)]), 10);
        let mut merged = old.to_pairs();
        merged.insert(b"c".to_vec(), 3);
        let next = TrieBucket::build(&merged, 10);
        assert_eq!(next.len(), 3);
        assert_eq!(next.get(b"a"), Some(1));
        assert_eq!(next.get(b"c"), Some(3));
    }
}
