//! Per-bucket sample counts accompanying query results.
//!
//! The timeline spans the queried range at the base resolution. Coarse
//! nodes left behind by retention down-sampling spread their samples
//! evenly across the buckets they cover.

use crate::storage::segment::{Segment, SegmentGeometry};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Timeline {
    pub start_time: DateTime<Utc>,
    /// Bucket span in seconds.
    pub duration_delta: i64,
    pub samples: Vec<u64>,
}

impl Timeline {
    /// An all-zero timeline covering `[st, et)` at the base resolution.
    pub fn generate(st: DateTime<Utc>, et: DateTime<Utc>, geo: &SegmentGeometry) -> Self {
        let (st, et) = geo.normalize(st, et);
        let delta = geo.resolution_secs();
        let buckets = ((et - st).num_seconds() / delta).max(0) as usize;
        Self {
            start_time: st,
            duration_delta: delta,
            samples: vec![0; buckets],
        }
    }

    /// Fold one segment's write coverage into the timeline.
    pub fn populate(&mut self, segment: &Segment) {
        let et = self.start_time + Duration::seconds(self.duration_delta * self.samples.len() as i64);
        segment.walk_leafmost(self.start_time, et, &mut |depth, time, samples| {
            let span = segment.geometry().resolution_secs()
                * (segment.geometry().multiplier() as i64).pow(depth as u32);
            let covered = span / self.duration_delta;
            let share = samples / covered.max(1) as u64;
            for i in 0..covered {
                let at = time + Duration::seconds(i * self.duration_delta);
                let offset = (at - self.start_time).num_seconds();
                if offset < 0 {
                    continue;
                }
                let idx = (offset / self.duration_delta) as usize;
                if let Some(slot) = self.samples.get_mut(idx) {
                    *slot += share;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::SegmentGeometry;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn geometry() -> Arc<SegmentGeometry> {
        Arc::new(SegmentGeometry::new(
            std::time::Duration::from_secs(10),
            10,
            16,
        ))
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_generate_bucket_count() {
        let tl = Timeline::generate(t(0), t(100), &geometry());
        assert_eq!(tl.samples.len(), 10);
        assert_eq!(tl.duration_delta, 10);
    }

    #[test]
    fn test_populate_places_samples() {
        let geo = geometry();
        let mut segment = Segment::new(Arc::clone(&geo));
        segment
            .put(t(10), t(19), 4, &mut |_, _, _, _| {})
            .unwrap();
        segment
            .put(t(30), t(39), 6, &mut |_, _, _, _| {})
            .unwrap();

        let mut tl = Timeline::generate(t(0), t(50), &geo);
        tl.populate(&segment);
        assert_eq!(tl.samples, vec![0, 4, 0, 6, 0]);
    }

    #[test]
    fn test_populate_ignores_out_of_range() {
        let geo = geometry();
        let mut segment = Segment::new(Arc::clone(&geo));
        segment
            .put(t(200), t(209), 5, &mut |_, _, _, _| {})
            .unwrap();

        let mut tl = Timeline::generate(t(0), t(50), &geo);
        tl.populate(&segment);
        assert_eq!(tl.samples, vec![0, 0, 0, 0, 0]);
    }
}
