//! Metric metadata database: identifier allocation and persistence
//!
//! Four KV families back the allocator: `ns` (namespace trie), `metric`
//! (per-namespace metric-name tries), `tag_value` (per-tag-key value tries)
//! and `schema` (per-metric field/tag-key schemas). New allocations buffer in
//! an in-memory delta; flushing is two-phase (`prepare_flush` snapshots the
//! delta, `flush` persists it with each family's sequence file), so a crash
//! between the phases only loses what WAL replay regenerates.

mod schema;
mod trie_bucket;

pub use schema::{MetricSchema, TagKeyMeta, HISTOGRAM_BUCKET_PREFIX};
pub use trie_bucket::TrieBucket;

use crate::config::Limits;
use crate::kv::{Family, FamilyOptions, Merger, MergerFactory, Rollup, Store};
use crate::types::{FieldId, FieldType, MetricId, TagKeyId, TagValueId};
use crate::{EmberError, Result};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Store name of the metadata database
pub const META_STORE_NAME: &str = "meta";

const NS_FAMILY: &str = "ns";
const METRIC_FAMILY: &str = "metric";
const TAG_VALUE_FAMILY: &str = "tag_value";
const SCHEMA_FAMILY: &str = "schema";

/// The namespace trie lives under a single key
const NS_TRIE_KEY: u32 = 0;

/// Keys per trie inside a bucket
const DEFAULT_TRIE_BLOCK_SIZE: usize = 4096;

const SEQUENCE_FILE_NAME: &str = "SEQUENCE";

/// Tag-filter leaf evaluated against one tag key's values
#[derive(Debug, Clone)]
pub enum TagValueFilter {
    Equal(String),
    In(Vec<String>),
    Like(String),
    Regex(String),
}

#[derive(Debug, Clone, Default)]
struct MetaDelta {
    namespaces: BTreeMap<String, u32>,
    metrics: BTreeMap<u32, BTreeMap<String, MetricId>>,
    tag_values: BTreeMap<TagKeyId, BTreeMap<String, TagValueId>>,
    schemas: BTreeMap<MetricId, MetricSchema>,
    sequence: i64,
}

impl MetaDelta {
    fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
            && self.metrics.is_empty()
            && self.tag_values.is_empty()
            && self.schemas.is_empty()
    }

    fn merge_from(&mut self, other: MetaDelta) {
        self.namespaces.extend(other.namespaces);
        for (ns, metrics) in other.metrics {
            self.metrics.entry(ns).or_default().extend(metrics);
        }
        for (key, values) in other.tag_values {
            self.tag_values.entry(key).or_default().extend(values);
        }
        self.schemas.extend(other.schemas);
        self.sequence = self.sequence.max(other.sequence);
    }
}

struct MetaInner {
    delta: MetaDelta,
    next_namespace_id: u32,
    next_metric_id: MetricId,
    next_tag_key_id: TagKeyId,
    next_tag_value_ids: HashMap<TagKeyId, TagValueId>,
    namespace_count: u32,
    metric_counts: HashMap<u32, u32>,
}

/// Process-wide metric metadata database
pub struct MetricMetaDatabase {
    limits: Limits,
    block_size: usize,
    ns_family: Arc<Family>,
    metric_family: Arc<Family>,
    tag_value_family: Arc<Family>,
    schema_family: Arc<Family>,
    inner: Mutex<MetaInner>,
    prepared: Mutex<Option<MetaDelta>>,
    flushed_sequence: AtomicI64,
}

impl MetricMetaDatabase {
    /// Open the metadata database inside the given store
    pub fn open(store: &Arc<Store>, limits: Limits) -> Result<Self> {
        let options = FamilyOptions {
            max_file_size: 64 * 1024 * 1024,
            level0_compaction_threshold: 4,
            merger: Arc::new(KeepLatestMergerFactory),
        };
        let ns_family = store.get_or_create_family(NS_FAMILY, options.clone())?;
        let metric_family = store.get_or_create_family(METRIC_FAMILY, options.clone())?;
        let tag_value_family = store.get_or_create_family(TAG_VALUE_FAMILY, options.clone())?;
        let schema_family = store.get_or_create_family(SCHEMA_FAMILY, options)?;

        let db = Self {
            limits,
            block_size: DEFAULT_TRIE_BLOCK_SIZE,
            ns_family,
            metric_family,
            tag_value_family,
            schema_family,
            inner: Mutex::new(MetaInner {
                delta: MetaDelta::default(),
                next_namespace_id: 1,
                next_metric_id: 1,
                next_tag_key_id: 1,
                next_tag_value_ids: HashMap::new(),
                namespace_count: 0,
                metric_counts: HashMap::new(),
            }),
            prepared: Mutex::new(None),
            flushed_sequence: AtomicI64::new(-1),
        };
        db.recover_counters()?;
        Ok(db)
    }

    /// Get or allocate the namespace id
    pub fn gen_namespace_id(&self, namespace: &str) -> Result<u32> {
        self.limits.check_namespace(namespace)?;
        let mut inner = self.inner.lock();
        if let Some(id) = inner.delta.namespaces.get(namespace) {
            return Ok(*id);
        }
        if let Some(id) = self
            .read_bucket(&self.ns_family, NS_TRIE_KEY)?
            .and_then(|bucket| bucket.get(namespace.as_bytes()))
        {
            return Ok(id);
        }
        if self.limits.max_namespaces > 0 && inner.namespace_count >= self.limits.max_namespaces {
            return Err(EmberError::TooManyNamespaces {
                max: self.limits.max_namespaces,
            });
        }
        let id = inner.next_namespace_id;
        inner.next_namespace_id += 1;
        inner.namespace_count += 1;
        inner.delta.namespaces.insert(namespace.to_string(), id);
        Ok(id)
    }

    /// Get or allocate the metric id of `(namespace, name)`
    pub fn gen_metric_id(&self, namespace: &str, name: &str) -> Result<MetricId> {
        self.limits.check_metric_name(name)?;
        let ns_id = self.gen_namespace_id(namespace)?;

        let mut inner = self.inner.lock();
        if let Some(id) = inner
            .delta
            .metrics
            .get(&ns_id)
            .and_then(|metrics| metrics.get(name))
        {
            return Ok(*id);
        }
        if let Some(id) = self
            .read_bucket(&self.metric_family, ns_id)?
            .and_then(|bucket| bucket.get(name.as_bytes()))
        {
            return Ok(id);
        }
        let count = inner.metric_counts.get(&ns_id).copied().unwrap_or(0);
        if self.limits.max_metrics > 0 && count >= self.limits.max_metrics {
            return Err(EmberError::TooManyMetrics {
                max: self.limits.max_metrics,
            });
        }
        let id = inner.next_metric_id;
        inner.next_metric_id += 1;
        inner.metric_counts.insert(ns_id, count + 1);
        inner
            .delta
            .metrics
            .entry(ns_id)
            .or_default()
            .insert(name.to_string(), id);
        inner.delta.schemas.insert(id, MetricSchema::new(id));
        Ok(id)
    }

    /// Metric id of `(namespace, name)`, if allocated
    pub fn get_metric_id(&self, namespace: &str, name: &str) -> Result<MetricId> {
        let ns_id = self
            .resolve_namespace_id(namespace)?
            .ok_or_else(|| EmberError::MetricNotFound(format!("{}|{}", namespace, name)))?;

        let inner = self.inner.lock();
        if let Some(id) = inner
            .delta
            .metrics
            .get(&ns_id)
            .and_then(|metrics| metrics.get(name))
        {
            return Ok(*id);
        }
        drop(inner);
        self.read_bucket(&self.metric_family, ns_id)?
            .and_then(|bucket| bucket.get(name.as_bytes()))
            .ok_or_else(|| EmberError::MetricNotFound(format!("{}|{}", namespace, name)))
    }

    /// Get or allocate a field id within a metric
    pub fn gen_field_id(
        &self,
        metric_id: MetricId,
        name: &str,
        field_type: FieldType,
    ) -> Result<FieldId> {
        self.limits.check_field_name(name)?;
        let mut inner = self.inner.lock();
        let mut schema = Self::schema_for_update(&mut inner, metric_id, |id| {
            self.read_schema(id)
        })?;
        let field_id = schema.ensure_field(name, field_type, self.limits.max_fields_per_metric)?;
        inner.delta.schemas.insert(metric_id, schema);
        Ok(field_id)
    }

    /// Get or allocate a tag key id within a metric
    pub fn gen_tag_key_id(&self, metric_id: MetricId, name: &str) -> Result<TagKeyId> {
        self.limits.check_tag_name(name)?;
        let mut inner = self.inner.lock();
        let mut schema = Self::schema_for_update(&mut inner, metric_id, |id| {
            self.read_schema(id)
        })?;
        if let Some(tag) = schema.tag_key(name) {
            return Ok(tag.id);
        }
        if self.limits.max_tags_per_metric > 0
            && schema.tag_keys.len() >= self.limits.max_tags_per_metric
        {
            return Err(EmberError::TooManyTagKeys {
                max: self.limits.max_tags_per_metric,
            });
        }
        let id = inner.next_tag_key_id;
        inner.next_tag_key_id += 1;
        schema.tag_keys.push(TagKeyMeta {
            id,
            name: name.to_string(),
        });
        inner.delta.schemas.insert(metric_id, schema);
        Ok(id)
    }

    /// Get or allocate a tag value id within a tag key
    pub fn gen_tag_value_id(&self, tag_key_id: TagKeyId, value: &str) -> Result<TagValueId> {
        self.limits.check_tag_value(value)?;
        let mut inner = self.inner.lock();
        if let Some(id) = inner
            .delta
            .tag_values
            .get(&tag_key_id)
            .and_then(|values| values.get(value))
        {
            return Ok(*id);
        }
        let persisted = self.read_bucket(&self.tag_value_family, tag_key_id)?;
        if let Some(id) = persisted
            .as_ref()
            .and_then(|bucket| bucket.get(value.as_bytes()))
        {
            return Ok(id);
        }

        let next = match inner.next_tag_value_ids.get(&tag_key_id) {
            Some(next) => *next,
            None => {
                let mut max = 0;
                if let Some(bucket) = &persisted {
                    bucket.scan(|_, id| max = max.max(id));
                }
                max + 1
            }
        };
        inner.next_tag_value_ids.insert(tag_key_id, next + 1);
        inner
            .delta
            .tag_values
            .entry(tag_key_id)
            .or_default()
            .insert(value.to_string(), next);
        Ok(next)
    }

    /// Schema of a metric
    pub fn get_schema(&self, metric_id: MetricId) -> Result<MetricSchema> {
        if let Some(schema) = self.inner.lock().delta.schemas.get(&metric_id) {
            return Ok(schema.clone());
        }
        self.read_schema(metric_id)?
            .ok_or_else(|| EmberError::MetricNotFound(format!("metric id {}", metric_id)))
    }

    /// Tag value ids matching a filter leaf
    pub fn find_tag_value_ids(
        &self,
        tag_key_id: TagKeyId,
        filter: &TagValueFilter,
    ) -> Result<RoaringBitmap> {
        let mut found = RoaringBitmap::new();
        match filter {
            TagValueFilter::Equal(value) => {
                if let Some(id) = self.lookup_tag_value(tag_key_id, value)? {
                    found.insert(id);
                }
            }
            TagValueFilter::In(values) => {
                for value in values {
                    if let Some(id) = self.lookup_tag_value(tag_key_id, value)? {
                        found.insert(id);
                    }
                }
            }
            TagValueFilter::Like(pattern) => {
                // pure-prefix patterns only walk the matching subtree
                if let Some(prefix) = pattern
                    .strip_suffix('%')
                    .filter(|head| !head.contains('%') && !head.is_empty())
                {
                    self.scan_tag_values_prefix(tag_key_id, prefix.as_bytes(), |_, id| {
                        found.insert(id);
                    })?;
                } else {
                    self.scan_tag_values(tag_key_id, |value, id| {
                        if like_match(pattern, value) {
                            found.insert(id);
                        }
                    })?;
                }
            }
            TagValueFilter::Regex(pattern) => {
                let re = regex::Regex::new(pattern)
                    .map_err(|e| EmberError::Plan(format!("bad regex: {}", e)))?;
                self.scan_tag_values(tag_key_id, |value, id| {
                    if re.is_match(value) {
                        found.insert(id);
                    }
                })?;
            }
        }
        Ok(found)
    }

    /// Value strings of the given tag value ids
    pub fn collect_tag_values(
        &self,
        tag_key_id: TagKeyId,
        ids: &RoaringBitmap,
    ) -> Result<HashMap<TagValueId, String>> {
        let mut values = HashMap::new();
        self.scan_tag_values(tag_key_id, |value, id| {
            if ids.contains(id) {
                values.insert(id, value.to_string());
            }
        })?;
        Ok(values)
    }

    /// Namespaces starting with `prefix`
    pub fn suggest_namespaces(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if let Some(bucket) = self.read_bucket(&self.ns_family, NS_TRIE_KEY)? {
            bucket.scan_prefix(prefix.as_bytes(), |key, _| {
                names.push(String::from_utf8_lossy(key).into_owned());
            });
        }
        for (name, _) in self.inner.lock().delta.namespaces.iter() {
            if name.starts_with(prefix) {
                names.push(name.clone());
            }
        }
        names.sort();
        names.dedup();
        names.truncate(limit);
        Ok(names)
    }

    /// Metric names in a namespace starting with `prefix`
    pub fn suggest_metrics(
        &self,
        namespace: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let Some(ns_id) = self.resolve_namespace_id(namespace)? else {
            return Ok(Vec::new());
        };
        let mut names = Vec::new();
        if let Some(bucket) = self.read_bucket(&self.metric_family, ns_id)? {
            bucket.scan_prefix(prefix.as_bytes(), |key, _| {
                names.push(String::from_utf8_lossy(key).into_owned());
            });
        }
        if let Some(metrics) = self.inner.lock().delta.metrics.get(&ns_id) {
            for name in metrics.keys() {
                if name.starts_with(prefix) {
                    names.push(name.clone());
                }
            }
        }
        names.sort();
        names.dedup();
        names.truncate(limit);
        Ok(names)
    }

    /// Tag values of a key starting with `prefix`
    pub fn suggest_tag_values(
        &self,
        tag_key_id: TagKeyId,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut values = Vec::new();
        self.scan_tag_values_prefix(tag_key_id, prefix.as_bytes(), |value, _| {
            values.push(value.to_string());
        })?;
        values.sort();
        values.dedup();
        values.truncate(limit);
        Ok(values)
    }

    /// Record the WAL sequence the in-memory delta has reached
    pub fn set_sequence(&self, sequence: i64) {
        let mut inner = self.inner.lock();
        inner.delta.sequence = inner.delta.sequence.max(sequence);
    }

    /// Last sequence made durable by `flush`
    pub fn flushed_sequence(&self) -> i64 {
        self.flushed_sequence.load(Ordering::Acquire)
    }

    /// Phase one: snapshot the in-memory delta for flushing
    pub fn prepare_flush(&self) {
        let mut inner = self.inner.lock();
        if inner.delta.is_empty() {
            return;
        }
        let delta = std::mem::take(&mut inner.delta);
        let mut prepared = self.prepared.lock();
        match prepared.as_mut() {
            Some(pending) => pending.merge_from(delta),
            None => *prepared = Some(delta),
        }
    }

    /// Phase two: persist the prepared delta and each family's sequence file
    pub fn flush(&self) -> Result<()> {
        let Some(delta) = self.prepared.lock().take() else {
            return Ok(());
        };
        let sequence = delta.sequence;

        // schemas land first: a crash mid-flush must never leave a
        // resolvable metric name without its schema
        if !delta.schemas.is_empty() {
            let mut builder = self.schema_family.new_table_builder()?;
            for (metric_id, schema) in &delta.schemas {
                builder.add(*metric_id, &schema.marshal()?)?;
            }
            self.schema_family.commit_flush(builder.close()?)?;
        }

        if !delta.namespaces.is_empty() {
            let mut pairs = self
                .read_bucket(&self.ns_family, NS_TRIE_KEY)?
                .map(|bucket| bucket.to_pairs())
                .unwrap_or_default();
            for (name, id) in &delta.namespaces {
                pairs.insert(name.as_bytes().to_vec(), *id);
            }
            let mut builder = self.ns_family.new_table_builder()?;
            builder.add(
                NS_TRIE_KEY,
                &TrieBucket::build(&pairs, self.block_size).marshal(),
            )?;
            self.ns_family.commit_flush(builder.close()?)?;
        }

        if !delta.metrics.is_empty() {
            let mut builder = self.metric_family.new_table_builder()?;
            for (ns_id, metrics) in &delta.metrics {
                let mut pairs = self
                    .read_bucket(&self.metric_family, *ns_id)?
                    .map(|bucket| bucket.to_pairs())
                    .unwrap_or_default();
                for (name, id) in metrics {
                    pairs.insert(name.as_bytes().to_vec(), *id);
                }
                builder.add(
                    *ns_id,
                    &TrieBucket::build(&pairs, self.block_size).marshal(),
                )?;
            }
            self.metric_family.commit_flush(builder.close()?)?;
        }

        if !delta.tag_values.is_empty() {
            let mut builder = self.tag_value_family.new_table_builder()?;
            for (tag_key_id, values) in &delta.tag_values {
                let mut pairs = self
                    .read_bucket(&self.tag_value_family, *tag_key_id)?
                    .map(|bucket| bucket.to_pairs())
                    .unwrap_or_default();
                for (value, id) in values {
                    pairs.insert(value.as_bytes().to_vec(), *id);
                }
                builder.add(
                    *tag_key_id,
                    &TrieBucket::build(&pairs, self.block_size).marshal(),
                )?;
            }
            self.tag_value_family.commit_flush(builder.close()?)?;
        }

        for family in [
            &self.ns_family,
            &self.metric_family,
            &self.tag_value_family,
            &self.schema_family,
        ] {
            write_sequence_file(family.dir(), sequence)?;
        }
        self.flushed_sequence.store(sequence, Ordering::Release);
        info!(sequence, "flushed metadata database");
        Ok(())
    }

    /// Run compaction on families that need it
    pub fn compact(&self) {
        for family in [
            &self.ns_family,
            &self.metric_family,
            &self.tag_value_family,
            &self.schema_family,
        ] {
            if family.needs_compaction() {
                if let Err(e) = family.compact() {
                    warn!(family = family.name(), error = %e, "meta compaction failure");
                }
            }
        }
    }

    fn schema_for_update<F>(
        inner: &mut MetaInner,
        metric_id: MetricId,
        read_persisted: F,
    ) -> Result<MetricSchema>
    where
        F: Fn(MetricId) -> Result<Option<MetricSchema>>,
    {
        if let Some(schema) = inner.delta.schemas.get(&metric_id) {
            return Ok(schema.clone());
        }
        read_persisted(metric_id)?
            .ok_or_else(|| EmberError::MetricNotFound(format!("metric id {}", metric_id)))
    }

    /// Resolve a namespace id without allocating
    fn resolve_namespace_id(&self, namespace: &str) -> Result<Option<u32>> {
        if let Some(id) = self.inner.lock().delta.namespaces.get(namespace) {
            return Ok(Some(*id));
        }
        Ok(self
            .read_bucket(&self.ns_family, NS_TRIE_KEY)?
            .and_then(|bucket| bucket.get(namespace.as_bytes())))
    }

    fn lookup_tag_value(
        &self,
        tag_key_id: TagKeyId,
        value: &str,
    ) -> Result<Option<TagValueId>> {
        if let Some(id) = self
            .inner
            .lock()
            .delta
            .tag_values
            .get(&tag_key_id)
            .and_then(|values| values.get(value))
        {
            return Ok(Some(*id));
        }
        Ok(self
            .read_bucket(&self.tag_value_family, tag_key_id)?
            .and_then(|bucket| bucket.get(value.as_bytes())))
    }

    fn scan_tag_values<F>(&self, tag_key_id: TagKeyId, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, TagValueId),
    {
        if let Some(bucket) = self.read_bucket(&self.tag_value_family, tag_key_id)? {
            bucket.scan(|key, id| visit(&String::from_utf8_lossy(key), id));
        }
        if let Some(values) = self.inner.lock().delta.tag_values.get(&tag_key_id) {
            for (value, id) in values {
                visit(value, *id);
            }
        }
        Ok(())
    }

    fn scan_tag_values_prefix<F>(
        &self,
        tag_key_id: TagKeyId,
        prefix: &[u8],
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&str, TagValueId),
    {
        if let Some(bucket) = self.read_bucket(&self.tag_value_family, tag_key_id)? {
            bucket.scan_prefix(prefix, |key, id| visit(&String::from_utf8_lossy(key), id));
        }
        if let Some(values) = self.inner.lock().delta.tag_values.get(&tag_key_id) {
            for (value, id) in values {
                if value.as_bytes().starts_with(prefix) {
                    visit(value, *id);
                }
            }
        }
        Ok(())
    }

    /// Newest persisted bucket under a key
    fn read_bucket(&self, family: &Arc<Family>, key: u32) -> Result<Option<TrieBucket>> {
        let snapshot = family.snapshot();
        for reader in snapshot.find_readers(key)? {
            match reader.get(key) {
                Ok(value) => return TrieBucket::unmarshal(value).map(Some),
                Err(EmberError::KeyNotExist) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn read_schema(&self, metric_id: MetricId) -> Result<Option<MetricSchema>> {
        let snapshot = self.schema_family.snapshot();
        for reader in snapshot.find_readers(metric_id)? {
            match reader.get(metric_id) {
                Ok(value) => return MetricSchema::unmarshal(value).map(Some),
                Err(EmberError::KeyNotExist) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Rebuild allocation counters from the persisted families
    fn recover_counters(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        if let Some(bucket) = self.read_bucket(&self.ns_family, NS_TRIE_KEY)? {
            let mut max = 0;
            let mut count = 0;
            bucket.scan(|_, id| {
                max = max.max(id);
                count += 1;
            });
            inner.next_namespace_id = max + 1;
            inner.namespace_count = count;
        }

        // walk every persisted metric bucket for the id high-water mark
        let snapshot = self.metric_family.snapshot();
        let mut seen = std::collections::HashSet::new();
        for reader in snapshot.readers()? {
            for (ns_id, _) in reader.iter() {
                if !seen.insert(ns_id) {
                    continue;
                }
                if let Some(bucket) = self.read_bucket(&self.metric_family, ns_id)? {
                    let mut max = 0;
                    let mut count = 0;
                    bucket.scan(|_, id| {
                        max = max.max(id);
                        count += 1;
                    });
                    inner.next_metric_id = inner.next_metric_id.max(max + 1);
                    inner.metric_counts.insert(ns_id, count);
                }
            }
        }

        // tag key ids come from schemas
        let snapshot = self.schema_family.snapshot();
        let mut seen = std::collections::HashSet::new();
        for reader in snapshot.readers()? {
            for (metric_id, value) in reader.iter() {
                if !seen.insert(metric_id) {
                    continue;
                }
                let schema = MetricSchema::unmarshal(value)?;
                for tag in &schema.tag_keys {
                    inner.next_tag_key_id = inner.next_tag_key_id.max(tag.id + 1);
                }
            }
        }

        self.flushed_sequence.store(
            read_sequence_file(self.schema_family.dir()).unwrap_or(-1),
            Ordering::Release,
        );
        Ok(())
    }
}

/// Keeps the newest duplicate during meta family compaction
struct KeepLatestMerger;

impl Merger for KeepLatestMerger {
    fn merge(&mut self, _key: u32, values: &[&[u8]]) -> Result<Vec<u8>> {
        // inputs arrive oldest first
        Ok(values.last().map(|value| value.to_vec()).unwrap_or_default())
    }
}

struct KeepLatestMergerFactory;

impl MergerFactory for KeepLatestMergerFactory {
    fn create(&self, _rollup: Option<Rollup>) -> Box<dyn Merger> {
        Box::new(KeepLatestMerger)
    }
}

/// Match a SQL LIKE pattern with `%` wildcards
fn like_match(pattern: &str, value: &str) -> bool {
    let segments: Vec<&str> = pattern.split('%').collect();
    if segments.len() == 1 {
        return pattern == value;
    }
    let mut rest = value;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(tail) = rest.strip_prefix(segment) else {
                return false;
            };
            rest = tail;
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            let Some(at) = rest.find(segment) else {
                return false;
            };
            rest = &rest[at + segment.len()..];
        }
    }
    true
}

fn write_sequence_file(dir: &Path, sequence: i64) -> Result<()> {
    let mut data = Vec::with_capacity(12);
    data.put_i64_le(sequence);
    data.put_u32_le(crc32fast::hash(&sequence.to_le_bytes()));
    std::fs::write(dir.join(SEQUENCE_FILE_NAME), data)?;
    Ok(())
}

fn read_sequence_file(dir: &Path) -> Option<i64> {
    let data = std::fs::read(dir.join(SEQUENCE_FILE_NAME)).ok()?;
    if data.len() != 12 {
        return None;
    }
    let mut cursor = std::io::Cursor::new(&data);
    let sequence = cursor.get_i64_le();
    let crc = cursor.get_u32_le();
    (crc32fast::hash(&data[..8]) == crc).then_some(sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::StoreManager;
    use tempfile::TempDir;

    fn open_db(dir: &Path) -> MetricMetaDatabase {
        let manager = StoreManager::new(dir);
        let store = manager.get_or_create_store(META_STORE_NAME).unwrap();
        MetricMetaDatabase::open(&store, Limits::default()).unwrap()
    }

    #[test]
    fn test_id_allocation_and_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(dir.path());
            let metric_id = db.gen_metric_id("default", "cpu").unwrap();
            assert_eq!(db.gen_metric_id("default", "cpu").unwrap(), metric_id);

            let f0 = db.gen_field_id(metric_id, "usage", FieldType::Sum).unwrap();
            let f1 = db.gen_field_id(metric_id, "idle", FieldType::Gauge).unwrap();
            assert_eq!((f0, f1), (0, 1));

            let host = db.gen_tag_key_id(metric_id, "host").unwrap();
            let v1 = db.gen_tag_value_id(host, "h1").unwrap();
            let v2 = db.gen_tag_value_id(host, "h2").unwrap();
            assert_ne!(v1, v2);
            assert_eq!(db.gen_tag_value_id(host, "h1").unwrap(), v1);

            db.set_sequence(42);
            db.prepare_flush();
            db.flush().unwrap();
            assert_eq!(db.flushed_sequence(), 42);
        }

        // ids survive a restart
        let db = open_db(dir.path());
        let metric_id = db.get_metric_id("default", "cpu").unwrap();
        let schema = db.get_schema(metric_id).unwrap();
        assert_eq!(schema.fields.len(), 2);
        assert_eq!(schema.field("usage").unwrap().id, 0);
        let host = schema.tag_key("host").unwrap().id;
        let v1 = db.gen_tag_value_id(host, "h1").unwrap();
        // a fresh value allocates past the persisted ones
        let v3 = db.gen_tag_value_id(host, "h3").unwrap();
        assert!(v3 > v1);
        assert_eq!(db.flushed_sequence(), 42);
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path());
        assert!(matches!(
            db.get_metric_id("default", "nope"),
            Err(EmberError::MetricNotFound(_))
        ));
        assert!(matches!(
            db.get_schema(99),
            Err(EmberError::MetricNotFound(_))
        ));
    }

    #[test]
    fn test_limits_enforced() {
        let dir = TempDir::new().unwrap();
        let manager = StoreManager::new(dir.path());
        let store = manager.get_or_create_store(META_STORE_NAME).unwrap();
        let limits = Limits {
            max_namespaces: 1,
            max_fields_per_metric: 1,
            max_tags_per_metric: 1,
            ..Limits::default()
        };
        let db = MetricMetaDatabase::open(&store, limits).unwrap();

        let metric_id = db.gen_metric_id("ns-a", "m").unwrap();
        assert!(matches!(
            db.gen_metric_id("ns-b", "m"),
            Err(EmberError::TooManyNamespaces { .. })
        ));

        db.gen_field_id(metric_id, "f1", FieldType::Sum).unwrap();
        assert!(matches!(
            db.gen_field_id(metric_id, "f2", FieldType::Sum),
            Err(EmberError::TooManyFields { .. })
        ));

        db.gen_tag_key_id(metric_id, "t1").unwrap();
        assert!(matches!(
            db.gen_tag_key_id(metric_id, "t2"),
            Err(EmberError::TooManyTagKeys { .. })
        ));

        assert!(matches!(
            db.gen_metric_id("ns-a", &"x".repeat(300)),
            Err(EmberError::NameTooLong { .. })
        ));
    }

    #[test]
    fn test_find_tag_value_ids() {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path());
        let metric_id = db.gen_metric_id("default", "cpu").unwrap();
        let host = db.gen_tag_key_id(metric_id, "host").unwrap();
        let h1 = db.gen_tag_value_id(host, "host-1").unwrap();
        let h2 = db.gen_tag_value_id(host, "host-2").unwrap();
        let web = db.gen_tag_value_id(host, "web-1").unwrap();

        let found = db
            .find_tag_value_ids(host, &TagValueFilter::Equal("host-1".into()))
            .unwrap();
        assert_eq!(found.iter().collect::<Vec<_>>(), vec![h1]);

        let found = db
            .find_tag_value_ids(
                host,
                &TagValueFilter::In(vec!["host-2".into(), "web-1".into(), "none".into()]),
            )
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains(h2) && found.contains(web));

        let found = db
            .find_tag_value_ids(host, &TagValueFilter::Like("host-%".into()))
            .unwrap();
        assert_eq!(found.len(), 2);

        let found = db
            .find_tag_value_ids(host, &TagValueFilter::Regex("^web-\\d$".into()))
            .unwrap();
        assert_eq!(found.iter().collect::<Vec<_>>(), vec![web]);

        // filters keep working after a flush
        db.prepare_flush();
        db.flush().unwrap();
        let found = db
            .find_tag_value_ids(host, &TagValueFilter::Like("%-1".into()))
            .unwrap();
        assert_eq!(found.len(), 2);

        let values = db
            .collect_tag_values(host, &found)
            .unwrap();
        assert_eq!(values[&h1], "host-1");
        assert_eq!(values[&web], "web-1");
    }

    #[test]
    fn test_suggest() {
        let dir = TempDir::new().unwrap();
        let db = open_db(dir.path());
        let metric_id = db.gen_metric_id("prod", "cpu_usage").unwrap();
        db.gen_metric_id("prod", "cpu_idle").unwrap();
        db.gen_metric_id("prod", "mem_used").unwrap();
        let host = db.gen_tag_key_id(metric_id, "host").unwrap();
        db.gen_tag_value_id(host, "web-1").unwrap();
        db.gen_tag_value_id(host, "web-2").unwrap();

        assert_eq!(db.suggest_namespaces("pr", 10).unwrap(), vec!["prod"]);
        assert_eq!(
            db.suggest_metrics("prod", "cpu_", 10).unwrap(),
            vec!["cpu_idle", "cpu_usage"]
        );
        assert_eq!(
            db.suggest_tag_values(host, "web-", 1).unwrap(),
            vec!["web-1"]
        );
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("abc", "abc"));
        assert!(!like_match("abc", "abd"));
        assert!(like_match("ab%", "abc"));
        assert!(like_match("%bc", "abc"));
        assert!(like_match("%b%", "abc"));
        assert!(like_match("a%c", "abc"));
        assert!(!like_match("a%d", "abc"));
        assert!(like_match("%", "anything"));
    }
}
