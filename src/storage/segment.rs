//! Segment tree ("stree"): an exponential interval tree tracking, per
//! label-set segment, which time buckets hold profiling data at which
//! resolution.
//!
//! Depth 0 nodes span the base resolution; each level up multiplies the
//! span by the branching factor. The root grows upward when writes fall
//! outside its span, and children materialize lazily on the way down.
//! Writes and reads communicate through callbacks carrying exact
//! rational overlap fractions, so repeated partial-interval scaling
//! never accumulates float error.

use crate::core::{EmberError, Result};
use crate::storage::retention::RetentionPolicy;
use chrono::{DateTime, Duration, Utc};
use num_rational::Ratio;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable bucket geometry shared by every segment of a store.
///
/// Owned per store and passed by `Arc` to each segment at construction;
/// two stores with different geometry cannot interfere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentGeometry {
    multiplier: usize,
    /// Span of one node at each depth, in seconds.
    durations: Vec<i64>,
}

impl SegmentGeometry {
    pub fn new(resolution: std::time::Duration, multiplier: usize, max_depth: usize) -> Self {
        let base = resolution.as_secs().max(1) as i64;
        let mut durations = Vec::with_capacity(max_depth);
        let mut span = base;
        for _ in 0..max_depth.max(1) {
            durations.push(span);
            match span.checked_mul(multiplier as i64) {
                Some(next) => span = next,
                None => break,
            }
        }
        Self {
            multiplier,
            durations,
        }
    }

    pub fn multiplier(&self) -> usize {
        self.multiplier
    }

    /// Base bucket span.
    pub fn resolution_secs(&self) -> i64 {
        self.durations[0]
    }

    pub fn max_depth(&self) -> usize {
        self.durations.len()
    }

    fn duration_at(&self, depth: usize) -> i64 {
        self.durations[depth]
    }

    /// Truncate down to a multiple of the given depth's span.
    pub fn truncate(&self, t: DateTime<Utc>, depth: usize) -> DateTime<Utc> {
        let span = self.duration_at(depth);
        let ts = t.timestamp();
        datetime(ts.div_euclid(span) * span)
    }

    /// Align `[st, et)` to the base resolution: start truncated down,
    /// end truncated up unless already aligned.
    pub fn normalize(&self, st: DateTime<Utc>, et: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let st = self.truncate(st, 0);
        let et2 = self.truncate(et, 0);
        if et2 == et && st != et2 {
            return (st, et);
        }
        (st, et2 + Duration::seconds(self.resolution_secs()))
    }
}

fn datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// How a node span relates to a query span. Exactly one definition,
/// used uniformly by both the write and the read walk:
/// `Inside` means the node lies within the query, `Contain` means the
/// node contains the query. Spans touching at a boundary are `Outside`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    Match,
    Inside,
    Contain,
    Overlap,
    Outside,
}

fn relationship(
    t1: DateTime<Utc>,
    t2: DateTime<Utc>,
    st: DateTime<Utc>,
    et: DateTime<Utc>,
) -> Relationship {
    if et <= t1 || t2 <= st {
        Relationship::Outside
    } else if t1 == st && t2 == et {
        Relationship::Match
    } else if st <= t1 && t2 <= et {
        Relationship::Inside
    } else if t1 <= st && et <= t2 {
        Relationship::Contain
    } else {
        Relationship::Overlap
    }
}

/// A pre-existing finer-grained aggregate that a newly settled coarse
/// node must fold in to stay consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addon {
    pub depth: usize,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreeNode {
    depth: usize,
    time: DateTime<Utc>,
    present: bool,
    samples: u64,
    writes: u64,
    children: Vec<Option<Box<StreeNode>>>,
}

impl StreeNode {
    fn new(time: DateTime<Utc>, depth: usize, multiplier: usize) -> Self {
        let children = if depth > 0 {
            (0..multiplier).map(|_| None).collect()
        } else {
            Vec::new()
        };
        Self {
            depth,
            time,
            present: false,
            samples: 0,
            writes: 0,
            children,
        }
    }

    fn end_time(&self, geo: &SegmentGeometry) -> DateTime<Utc> {
        self.time + Duration::seconds(geo.duration_at(self.depth))
    }

    fn relationship(&self, geo: &SegmentGeometry, st: DateTime<Utc>, et: DateTime<Utc>) -> Relationship {
        relationship(self.time, self.end_time(geo), st, et)
    }

    fn is_before(&self, geo: &SegmentGeometry, rt: DateTime<Utc>) -> bool {
        self.end_time(geo) <= rt
    }

    fn is_after(&self, rt: DateTime<Utc>) -> bool {
        self.time > rt
    }

    /// Fraction of this node's span covered by `[st, et)`.
    fn overlap_read(&self, geo: &SegmentGeometry, st: DateTime<Utc>, et: DateTime<Utc>) -> Ratio<u64> {
        let t2 = self.end_time(geo);
        let covered = (t2.min(et) - self.time.max(st)).num_seconds().max(0) as u64;
        Ratio::new(covered, geo.duration_at(self.depth) as u64)
    }

    /// Fraction of the write `[st, et)` that lands in this node's span.
    fn overlap_write(&self, geo: &SegmentGeometry, st: DateTime<Utc>, et: DateTime<Utc>) -> Ratio<u64> {
        let t2 = self.end_time(geo);
        let covered = (t2.min(et) - self.time.max(st)).num_seconds().max(0) as u64;
        Ratio::new(covered, (et - st).num_seconds() as u64)
    }

    /// Collect present descendants. Called on a node about to become
    /// present for the first time: its new aggregate must account for
    /// data already recorded more granularly below it.
    fn find_addons(&self, out: &mut Vec<Addon>) {
        if self.present {
            out.push(Addon {
                depth: self.depth,
                time: self.time,
            });
            return;
        }
        for child in self.children.iter().flatten() {
            child.find_addons(out);
        }
    }

    /// Re-parent an old root under a freshly grown one.
    fn replace(&mut self, geo: &SegmentGeometry, child: Box<StreeNode>) {
        let i = (child.time - self.time).num_seconds() / geo.duration_at(child.depth);
        self.children[i as usize] = Some(child);
    }

    fn put(
        &mut self,
        geo: &SegmentGeometry,
        st: DateTime<Utc>,
        et: DateTime<Utc>,
        samples: u64,
        cb: &mut dyn FnMut(usize, DateTime<Utc>, Ratio<u64>, &[Addon]),
    ) {
        let rel = self.relationship(geo, st, et);
        if rel == Relationship::Outside {
            return;
        }

        let mut children_count = 0;
        let create_children =
            rel == Relationship::Contain || rel == Relationship::Overlap;
        if self.depth > 0 {
            let child_span = geo.duration_at(self.depth - 1);
            for i in 0..self.children.len() {
                if create_children && self.children[i].is_none() {
                    let child_t = self.time + Duration::seconds(i as i64 * child_span);
                    let child_rel =
                        relationship(child_t, child_t + Duration::seconds(child_span), st, et);
                    if child_rel != Relationship::Outside {
                        self.children[i] = Some(Box::new(StreeNode::new(
                            child_t,
                            self.depth - 1,
                            geo.multiplier,
                        )));
                    }
                }
                if self.children[i].is_some() {
                    children_count += 1;
                }
            }
        }

        let r = self.overlap_write(geo, st, et);
        self.samples += scale(samples, r);
        self.writes += 1;

        // Settle here when the write covers this node entirely, when the
        // write touches more than one child, or when an aggregate for
        // this node already exists and must stay current.
        if rel == Relationship::Match
            || rel == Relationship::Inside
            || children_count > 1
            || self.present
        {
            let mut addons = Vec::new();
            if !self.present {
                for child in self.children.iter().flatten() {
                    child.find_addons(&mut addons);
                }
            }
            cb(self.depth, self.time, r, &addons);
            self.present = true;
        }

        for child in self.children.iter_mut().flatten() {
            child.put(geo, st, et, samples, cb);
        }
    }

    fn get(
        &self,
        geo: &SegmentGeometry,
        watermarks: &Watermarks,
        st: DateTime<Utc>,
        et: DateTime<Utc>,
        cb: &mut dyn FnMut(&StreeNode, Ratio<u64>),
    ) {
        match self.relationship(geo, st, et) {
            Relationship::Outside => return,
            Relationship::Contain | Relationship::Overlap => {
                // Defer to children.
            },
            Relationship::Inside | Relationship::Match => {
                // The aggregate covers everything needed.
                if self.present {
                    cb(self, Ratio::new(1, 1));
                    return;
                }
            },
        }
        // Children dropped by level retention: serve a down-sampled
        // share of this node's own aggregate instead.
        if self.depth > 0 && self.present {
            if let Some(wm) = watermarks.levels.get(&(self.depth - 1)) {
                if self.time < *wm {
                    cb(self, self.overlap_read(geo, st, et));
                    return;
                }
            }
        }
        for child in self.children.iter().flatten() {
            child.get(geo, watermarks, st, et, cb);
        }
    }

    /// Prune stale descendants in place; returns whether this node is
    /// itself due for deletion.
    fn delete_nodes_before(&mut self, geo: &SegmentGeometry, policy: &RetentionPolicy) -> bool {
        if policy.levels_empty() && self.is_after(policy.absolute_time()) {
            return false;
        }
        let remove = self.is_before(geo, policy.threshold_for_level(self.depth));
        for slot in &mut self.children {
            if let Some(child) = slot {
                if child.delete_nodes_before(geo, policy) {
                    *slot = None;
                }
            }
        }
        remove
    }

    /// Report every node the policy would delete, parents before
    /// children, without mutating the tree.
    fn walk_nodes_to_delete(
        &self,
        geo: &SegmentGeometry,
        policy: &RetentionPolicy,
        cb: &mut dyn FnMut(usize, DateTime<Utc>) -> Result<()>,
    ) -> Result<bool> {
        if policy.levels_empty() && self.is_after(policy.absolute_time()) {
            return Ok(false);
        }
        let remove = self.is_before(geo, policy.threshold_for_level(self.depth));
        if remove {
            cb(self.depth, self.time)?;
        }
        for child in self.children.iter().flatten() {
            child.walk_nodes_to_delete(geo, policy, cb)?;
        }
        Ok(remove)
    }

    fn walk_leafmost(
        &self,
        geo: &SegmentGeometry,
        st: DateTime<Utc>,
        et: DateTime<Utc>,
        cb: &mut dyn FnMut(usize, DateTime<Utc>, u64),
    ) {
        if self.relationship(geo, st, et) == Relationship::Outside {
            return;
        }
        let mut has_children = false;
        for child in self.children.iter().flatten() {
            has_children = true;
            child.walk_leafmost(geo, st, et, cb);
        }
        if !has_children && self.present {
            cb(self.depth, self.time, self.samples);
        }
    }
}

fn scale(samples: u64, r: Ratio<u64>) -> u64 {
    ((samples as u128 * *r.numer() as u128) / *r.denom() as u128) as u64
}

/// Retention enforcement watermarks: reads below a watermark fall back
/// to coarser aggregates because the finer ones are gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watermarks {
    pub absolute_time: DateTime<Utc>,
    pub levels: HashMap<usize, DateTime<Utc>>,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            absolute_time: DateTime::UNIX_EPOCH,
            levels: HashMap::new(),
        }
    }
}

/// Whether query results sum contributing writes or average over them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationType {
    #[default]
    Sum,
    Average,
}

/// Sample value units, carried through to query output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Samples,
    Objects,
    Bytes,
}

/// Ingestion metadata attached to a segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub spy_name: String,
    pub sample_rate: u32,
    pub units: Units,
    pub aggregation_type: AggregationType,
}

/// One label-set's write coverage over time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    #[serde(skip)]
    geometry: Arc<SegmentGeometry>,
    root: Option<Box<StreeNode>>,
    metadata: SegmentMetadata,
    watermarks: Watermarks,
}

impl Segment {
    pub fn new(geometry: Arc<SegmentGeometry>) -> Self {
        Self {
            geometry,
            root: None,
            metadata: SegmentMetadata::default(),
            watermarks: Watermarks::default(),
        }
    }

    /// Attach geometry after deserialization; persisted segments do not
    /// carry it.
    pub fn set_geometry(&mut self, geometry: Arc<SegmentGeometry>) {
        self.geometry = geometry;
    }

    pub fn metadata(&self) -> &SegmentMetadata {
        &self.metadata
    }

    pub fn set_metadata(&mut self, metadata: SegmentMetadata) {
        self.metadata = metadata;
    }

    fn grow_tree(&mut self, st: DateTime<Utc>, et: DateTime<Utc>) -> Result<()> {
        let geo = Arc::clone(&self.geometry);
        let (mut st, mut et) = (st, et);
        match &self.root {
            Some(root) => {
                st = st.min(root.time);
                et = et.max(root.end_time(&geo));
            },
            None => {
                st = geo.truncate(st, 0);
                self.root = Some(Box::new(StreeNode::new(st, 0, geo.multiplier())));
            },
        }

        loop {
            let root = self.root.as_ref().unwrap();
            match root.relationship(&geo, st, et) {
                Relationship::Contain | Relationship::Match => return Ok(()),
                _ => {},
            }
            let new_depth = root.depth + 1;
            if new_depth >= geo.max_depth() {
                return Err(EmberError::SegmentDepthLimit);
            }
            let prev = self.root.take().unwrap();
            let mut new_root = StreeNode::new(
                geo.truncate(prev.time, new_depth),
                new_depth,
                geo.multiplier(),
            );
            new_root.samples = prev.samples;
            new_root.writes = prev.writes;
            new_root.replace(&geo, prev);
            self.root = Some(Box::new(new_root));
        }
    }

    /// Record `[st, et)` carrying `samples`, invoking the callback with
    /// `(depth, bucket time, overlap ratio, addons)` for every settled
    /// node. The caller scales and merges its profile tree accordingly.
    pub fn put(
        &mut self,
        st: DateTime<Utc>,
        et: DateTime<Utc>,
        samples: u64,
        cb: &mut dyn FnMut(usize, DateTime<Utc>, Ratio<u64>, &[Addon]),
    ) -> Result<()> {
        let geo = Arc::clone(&self.geometry);
        let (st, et) = geo.normalize(st, et);
        if st > et {
            return Err(EmberError::InvalidTimeRange);
        }
        self.grow_tree(st, et)?;
        if let Some(root) = &mut self.root {
            root.put(&geo, st, et, samples, cb);
        }
        Ok(())
    }

    /// Walk `[st, et)` read-only, invoking the callback with
    /// `(depth, samples, writes, bucket time, overlap ratio)` for every
    /// present node covering the range. A segment that has never been
    /// written yields nothing.
    pub fn get(
        &self,
        st: DateTime<Utc>,
        et: DateTime<Utc>,
        cb: &mut dyn FnMut(usize, u64, u64, DateTime<Utc>, Ratio<u64>),
    ) {
        let st = st.max(self.watermarks.absolute_time);
        let (st, et) = self.geometry.normalize(st, et);
        let Some(root) = &self.root else { return };
        root.get(&self.geometry, &self.watermarks, st, et, &mut |n, r| {
            cb(n.depth, n.samples, n.writes, n.time, r)
        });
    }

    /// Remove nodes past retention. Returns true when the whole tree
    /// was stale and the segment itself should be deleted.
    pub fn delete_nodes_before(&mut self, policy: &RetentionPolicy) -> bool {
        let geo = Arc::clone(&self.geometry);
        let policy = policy.normalize(&geo);
        let removed_root = match &mut self.root {
            None => true,
            Some(root) => root.delete_nodes_before(&geo, &policy),
        };
        if removed_root {
            self.root = None;
        }
        self.update_watermarks(&policy);
        removed_root
    }

    /// Report the `(depth, time)` buckets retention would delete,
    /// without mutating the tree. Aggregate deletion must be committed
    /// before [`Self::delete_nodes_before`] removes the nodes, so an
    /// interrupted sweep can resume.
    pub fn walk_nodes_to_delete(
        &self,
        policy: &RetentionPolicy,
        cb: &mut dyn FnMut(usize, DateTime<Utc>) -> Result<()>,
    ) -> Result<bool> {
        let policy = policy.normalize(&self.geometry);
        match &self.root {
            None => Ok(true),
            Some(root) => root.walk_nodes_to_delete(&self.geometry, &policy, cb),
        }
    }

    fn update_watermarks(&mut self, policy: &RetentionPolicy) {
        if policy.absolute_time() > self.watermarks.absolute_time {
            self.watermarks.absolute_time = policy.absolute_time();
        }
        for (depth, t) in policy.levels() {
            let entry = self.watermarks.levels.entry(*depth).or_insert(*t);
            if *t > *entry {
                *entry = *t;
            }
        }
    }

    /// Earliest bucket with data, if any.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        let mut node = self.root.as_deref()?;
        loop {
            match node.children.iter().flatten().next() {
                Some(child) => node = child,
                None => return Some(node.time),
            }
        }
    }

    /// Visit the finest present nodes overlapping `[st, et)`; feeds the
    /// query timeline.
    pub fn walk_leafmost(
        &self,
        st: DateTime<Utc>,
        et: DateTime<Utc>,
        cb: &mut dyn FnMut(usize, DateTime<Utc>, u64),
    ) {
        let (st, et) = self.geometry.normalize(st, et);
        if let Some(root) = &self.root {
            root.walk_leafmost(&self.geometry, st, et, cb);
        }
    }

    pub fn geometry(&self) -> &Arc<SegmentGeometry> {
        &self.geometry
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }
}
