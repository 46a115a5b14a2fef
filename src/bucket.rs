//! Bucket registry: named work partitions with independent dispatch knobs.
//!
//! Buckets are created on demand. A new bucket starts as a snapshot of the
//! default bucket's configuration and callback slots at the moment of
//! creation; later edits to the default do not propagate.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::callback::BucketCallbacks;
use crate::error::{PreforkError, Result};

/// Identifier of the implicit default bucket.
pub const DEFAULT_BUCKET: &str = "default";

/// Wall-clock run limit for one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLimit {
    /// No limit; the child runs until it exits on its own.
    Unlimited,
    /// Kill the child once it has been alive longer than this many seconds.
    /// Zero means the deadline is already due on the next housekeeping pass.
    Secs(u64),
}

impl RunLimit {
    /// Convert from the knob encoding: -1 is unlimited, 0 is an immediate
    /// deadline, anything below -1 clamps to unlimited.
    pub fn from_knob(secs: i64) -> (Self, bool) {
        match secs {
            -1 => (Self::Unlimited, false),
            s if s < -1 => (Self::Unlimited, true),
            s => (Self::Secs(s as u64), false),
        }
    }

    /// The knob encoding of this limit.
    pub fn as_knob(&self) -> i64 {
        match self {
            Self::Unlimited => -1,
            Self::Secs(s) => *s as i64,
        }
    }
}

/// Per-bucket dispatch knobs.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Maximum concurrently active children; 0 disables dispatch entirely.
    pub max_children: usize,
    /// Items handed to one worker per fork (forced to 1 in single-item mode).
    pub max_work_per_child: usize,
    /// Wall-clock limit enforced by housekeeping.
    pub child_max_run_time: RunLimit,
    /// Each child receives exactly one identified item.
    pub single_work_item: bool,
    /// Keep `max_children` workers alive regardless of queue depth.
    pub persistent_mode: bool,
    /// Payload handed to every persistent-mode worker.
    pub persistent_mode_data: Value,
}

impl Default for BucketConfig {
    fn default() -> Self {
        const DEFAULT_WORKERS: usize = 4;
        Self {
            max_children: DEFAULT_WORKERS,
            max_work_per_child: 1,
            child_max_run_time: RunLimit::Unlimited,
            single_work_item: false,
            persistent_mode: false,
            persistent_mode_data: Value::Null,
        }
    }
}

/// One queued unit of work. Only single-item buckets carry identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub ident: Option<String>,
    pub payload: Value,
}

/// The slice of a bucket's queue handed to one forked child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkBatch {
    /// Head-of-queue items from an ordered bucket.
    Items(Vec<Value>),
    /// Exactly one identified item from a single-item bucket.
    Single { ident: String, item: Value },
    /// The fixed payload of a persistent-mode bucket.
    Persistent(Value),
}

impl WorkBatch {
    /// Number of work items in the batch.
    pub fn len(&self) -> usize {
        match self {
            Self::Items(items) => items.len(),
            Self::Single { .. } | Self::Persistent(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Items(items) if items.is_empty())
    }

    /// The identifier travelling with the batch; empty outside single-item
    /// mode.
    pub fn ident(&self) -> &str {
        match self {
            Self::Single { ident, .. } => ident,
            _ => "",
        }
    }
}

/// One named work partition.
pub(crate) struct Bucket {
    pub config: BucketConfig,
    pub callbacks: BucketCallbacks,
    pub queue: VecDeque<WorkItem>,
    pub pending_results: VecDeque<Value>,
}

impl Bucket {
    fn derived_from(other: &Bucket) -> Self {
        Self {
            config: other.config.clone(),
            callbacks: other.callbacks.clone(),
            queue: VecDeque::new(),
            pending_results: VecDeque::new(),
        }
    }
}

/// Registry of every known bucket, keyed by id.
pub(crate) struct BucketRegistry {
    buckets: BTreeMap<String, Bucket>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(
            DEFAULT_BUCKET.to_string(),
            Bucket {
                config: BucketConfig::default(),
                callbacks: BucketCallbacks::default(),
                queue: VecDeque::new(),
                pending_results: VecDeque::new(),
            },
        );
        Self { buckets }
    }

    /// Fetch a bucket, creating it as a snapshot of the default bucket.
    pub fn ensure(&mut self, id: &str) -> &mut Bucket {
        if !self.buckets.contains_key(id) {
            let template = Bucket::derived_from(
                self.buckets
                    .get(DEFAULT_BUCKET)
                    .unwrap_or_else(|| unreachable!("default bucket always exists")),
            );
            tracing::debug!(bucket = id, "created bucket from default snapshot");
            self.buckets.insert(id.to_string(), template);
        }
        self.buckets.get_mut(id).unwrap_or_else(|| unreachable!())
    }

    pub fn get(&self, id: &str) -> Option<&Bucket> {
        self.buckets.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Bucket> {
        self.buckets.get_mut(id)
    }

    pub fn config(&self, id: &str) -> Result<&BucketConfig> {
        self.buckets
            .get(id)
            .map(|b| &b.config)
            .ok_or_else(|| PreforkError::UnknownBucket(id.to_string()))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.buckets.contains_key(id)
    }

    pub fn ids(&self, include_default: bool) -> Vec<String> {
        self.buckets
            .keys()
            .filter(|id| include_default || id.as_str() != DEFAULT_BUCKET)
            .cloned()
            .collect()
    }

    /// Append work to a bucket's queue, creating the bucket if needed.
    ///
    /// Ordered buckets take the items as-is. Single-item buckets require an
    /// identifier and enqueue the call as one identified unit (the lone item,
    /// or the item array when several are given).
    pub fn add_work(
        &mut self,
        id: &str,
        items: Vec<Value>,
        identifier: Option<&str>,
        sort: bool,
    ) -> Result<()> {
        let bucket = self.ensure(id);
        if bucket.config.single_work_item {
            let ident = identifier.ok_or_else(|| {
                PreforkError::Config(format!(
                    "bucket '{id}' is in single-item mode; work needs an identifier"
                ))
            })?;
            let payload = match items.len() {
                0 => {
                    return Err(PreforkError::Config(
                        "cannot add an empty work unit".to_string(),
                    ));
                }
                1 => items.into_iter().next().unwrap_or(Value::Null),
                _ => Value::Array(items),
            };
            bucket.queue.push_back(WorkItem {
                ident: Some(ident.to_string()),
                payload,
            });
        } else {
            bucket.queue.extend(items.into_iter().map(|payload| WorkItem {
                ident: None,
                payload,
            }));
        }

        if sort {
            let mut drained: Vec<WorkItem> = bucket.queue.drain(..).collect();
            drained.sort_by_cached_key(|item| item.payload.to_string());
            bucket.queue.extend(drained);
        }
        Ok(())
    }

    pub fn queue_len(&self, id: &str) -> usize {
        self.buckets.get(id).map_or(0, |b| b.queue.len())
    }

    /// Pop the next batch off the head of the queue.
    ///
    /// Persistent buckets always yield their fixed payload; for the rest,
    /// `None` means the queue is empty.
    pub fn extract_batch(&mut self, id: &str) -> Result<Option<(WorkBatch, String)>> {
        let bucket = self
            .buckets
            .get_mut(id)
            .ok_or_else(|| PreforkError::UnknownBucket(id.to_string()))?;

        if bucket.config.persistent_mode {
            let batch = WorkBatch::Persistent(bucket.config.persistent_mode_data.clone());
            return Ok(Some((batch, String::new())));
        }

        if bucket.queue.is_empty() {
            return Ok(None);
        }

        if bucket.config.single_work_item {
            let item = bucket.queue.pop_front().unwrap_or(WorkItem {
                ident: None,
                payload: Value::Null,
            });
            let ident = item.ident.unwrap_or_default();
            return Ok(Some((
                WorkBatch::Single {
                    ident: ident.clone(),
                    item: item.payload,
                },
                ident,
            )));
        }

        let take = bucket.config.max_work_per_child.max(1);
        let mut items = Vec::with_capacity(take.min(bucket.queue.len()));
        while items.len() < take {
            match bucket.queue.pop_front() {
                Some(item) => items.push(item.payload),
                None => break,
            }
        }
        Ok(Some((WorkBatch::Items(items), String::new())))
    }

    /// Put a batch back at the head of the queue, preserving order. Used when
    /// a fork fails so no work is lost.
    pub fn requeue_front(&mut self, id: &str, batch: WorkBatch) {
        let Some(bucket) = self.buckets.get_mut(id) else {
            return;
        };
        match batch {
            WorkBatch::Items(items) => {
                for payload in items.into_iter().rev() {
                    bucket.queue.push_front(WorkItem {
                        ident: None,
                        payload,
                    });
                }
            }
            WorkBatch::Single { ident, item } => bucket.queue.push_front(WorkItem {
                ident: Some(ident),
                payload: item,
            }),
            WorkBatch::Persistent(_) => {}
        }
    }

    /// Preview the batches the dispatcher would extract, without consuming.
    pub fn work_sets(&self, id: &str) -> Vec<Vec<WorkItem>> {
        let Some(bucket) = self.buckets.get(id) else {
            return Vec::new();
        };
        let chunk = if bucket.config.single_work_item {
            1
        } else {
            bucket.config.max_work_per_child.max(1)
        };
        let items: Vec<WorkItem> = bucket.queue.iter().cloned().collect();
        items.chunks(chunk).map(|c| c.to_vec()).collect()
    }

    /// Drop every queue and stored result. Called in a freshly forked child
    /// so it holds no aliased copy of the parent's bookkeeping.
    pub fn clear_runtime_state(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.queue.clear();
            bucket.pending_results.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_limit_knob_roundtrip() {
        assert_eq!(RunLimit::from_knob(-1), (RunLimit::Unlimited, false));
        assert_eq!(RunLimit::from_knob(-7), (RunLimit::Unlimited, true));
        assert_eq!(RunLimit::from_knob(0), (RunLimit::Secs(0), false));
        assert_eq!(RunLimit::from_knob(90), (RunLimit::Secs(90), false));
        assert_eq!(RunLimit::Secs(90).as_knob(), 90);
        assert_eq!(RunLimit::Unlimited.as_knob(), -1);
    }

    #[test]
    fn test_bucket_snapshot_from_default() {
        let mut registry = BucketRegistry::new();
        registry.ensure(DEFAULT_BUCKET).config.max_children = 9;

        // Created now: inherits max_children = 9.
        registry.ensure("thumbnails");
        assert_eq!(registry.config("thumbnails").unwrap().max_children, 9);

        // Later edits to the default must not propagate.
        registry.ensure(DEFAULT_BUCKET).config.max_children = 2;
        assert_eq!(registry.config("thumbnails").unwrap().max_children, 9);
        assert_eq!(registry.config(DEFAULT_BUCKET).unwrap().max_children, 2);
    }

    #[test]
    fn test_ordered_extraction_is_fifo() {
        let mut registry = BucketRegistry::new();
        registry.ensure(DEFAULT_BUCKET).config.max_work_per_child = 3;
        registry
            .add_work(
                DEFAULT_BUCKET,
                (1..=7).map(|n| json!(n)).collect(),
                None,
                false,
            )
            .unwrap();

        let mut batches = Vec::new();
        while let Some((batch, _ident)) = registry.extract_batch(DEFAULT_BUCKET).unwrap() {
            match batch {
                WorkBatch::Items(items) => batches.push(items),
                other => panic!("unexpected batch {other:?}"),
            }
        }

        assert_eq!(
            batches,
            vec![
                vec![json!(1), json!(2), json!(3)],
                vec![json!(4), json!(5), json!(6)],
                vec![json!(7)],
            ]
        );
        assert_eq!(registry.queue_len(DEFAULT_BUCKET), 0);
    }

    #[test]
    fn test_single_item_identifier_roundtrip() {
        let mut registry = BucketRegistry::new();
        registry.ensure("jobs").config.single_work_item = true;
        registry
            .add_work("jobs", vec![json!("work-A")], Some("A"), false)
            .unwrap();
        registry
            .add_work("jobs", vec![json!("work-B")], Some("B"), false)
            .unwrap();

        let (batch, ident) = registry.extract_batch("jobs").unwrap().unwrap();
        assert_eq!(ident, "A");
        assert_eq!(
            batch,
            WorkBatch::Single {
                ident: "A".to_string(),
                item: json!("work-A"),
            }
        );

        let (_, ident) = registry.extract_batch("jobs").unwrap().unwrap();
        assert_eq!(ident, "B");
    }

    #[test]
    fn test_single_item_requires_identifier() {
        let mut registry = BucketRegistry::new();
        registry.ensure("jobs").config.single_work_item = true;
        let err = registry
            .add_work("jobs", vec![json!("w")], None, false)
            .unwrap_err();
        assert!(matches!(err, PreforkError::Config(_)));
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let mut registry = BucketRegistry::new();
        registry.ensure(DEFAULT_BUCKET).config.max_work_per_child = 2;
        registry
            .add_work(
                DEFAULT_BUCKET,
                vec![json!("a"), json!("b"), json!("c")],
                None,
                false,
            )
            .unwrap();

        let (batch, _) = registry.extract_batch(DEFAULT_BUCKET).unwrap().unwrap();
        registry.requeue_front(DEFAULT_BUCKET, batch);

        let order: Vec<Value> = registry
            .get(DEFAULT_BUCKET)
            .unwrap()
            .queue
            .iter()
            .map(|w| w.payload.clone())
            .collect();
        assert_eq!(order, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_persistent_extraction_ignores_queue() {
        let mut registry = BucketRegistry::new();
        let bucket = registry.ensure("workers");
        bucket.config.persistent_mode = true;
        bucket.config.persistent_mode_data = json!({"cfg": 1});

        let (batch, ident) = registry.extract_batch("workers").unwrap().unwrap();
        assert_eq!(batch, WorkBatch::Persistent(json!({"cfg": 1})));
        assert_eq!(ident, "");
        // And again: persistent batches never run out.
        assert!(registry.extract_batch("workers").unwrap().is_some());
    }

    #[test]
    fn test_sorted_add_work() {
        let mut registry = BucketRegistry::new();
        registry
            .add_work(
                DEFAULT_BUCKET,
                vec![json!("pear"), json!("apple"), json!("mango")],
                None,
                true,
            )
            .unwrap();
        let order: Vec<Value> = registry
            .get(DEFAULT_BUCKET)
            .unwrap()
            .queue
            .iter()
            .map(|w| w.payload.clone())
            .collect();
        assert_eq!(order, vec![json!("apple"), json!("mango"), json!("pear")]);
    }

    #[test]
    fn test_work_sets_preview() {
        let mut registry = BucketRegistry::new();
        registry.ensure(DEFAULT_BUCKET).config.max_work_per_child = 2;
        registry
            .add_work(
                DEFAULT_BUCKET,
                vec![json!(1), json!(2), json!(3)],
                None,
                false,
            )
            .unwrap();
        let sets = registry.work_sets(DEFAULT_BUCKET);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].len(), 2);
        assert_eq!(sets[1].len(), 1);
        // Preview must not consume.
        assert_eq!(registry.queue_len(DEFAULT_BUCKET), 3);
    }
}
