//! Hourly resampling of raw samples

use crate::models::MetricSample;
use std::collections::BTreeMap;

/// Seconds per resampled step
pub const STEP_SECS: i64 = 3600;

/// Regular hourly series of CPU and memory percentages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HourlySeries {
    /// Start of the first bucket (hour aligned, unix seconds)
    pub start: i64,
    pub cpu: Vec<f64>,
    pub mem: Vec<f64>,
}

impl HourlySeries {
    pub fn len(&self) -> usize {
        self.cpu.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty()
    }

    /// Start of the last bucket
    pub fn last_bucket(&self) -> Option<i64> {
        if self.is_empty() {
            None
        } else {
            Some(self.start + (self.len() as i64 - 1) * STEP_SECS)
        }
    }

    /// Timestamp of the bucket at `index`
    pub fn bucket_at(&self, index: usize) -> i64 {
        self.start + index as i64 * STEP_SECS
    }
}

/// Start of the hour containing `timestamp`
pub fn hour_floor(timestamp: i64) -> i64 {
    timestamp.div_euclid(STEP_SECS) * STEP_SECS
}

/// Mean-aggregate samples into hourly buckets, forward-filling empty hours
pub fn resample_hourly(samples: &[MetricSample]) -> HourlySeries {
    let mut buckets: BTreeMap<i64, (f64, f64, usize)> = BTreeMap::new();
    for s in samples {
        let entry = buckets.entry(hour_floor(s.timestamp)).or_insert((0.0, 0.0, 0));
        entry.0 += s.cpu_pct;
        entry.1 += s.mem_pct;
        entry.2 += 1;
    }

    let (Some(&first), Some(&last)) = (buckets.keys().next(), buckets.keys().next_back()) else {
        return HourlySeries::default();
    };

    let steps = ((last - first) / STEP_SECS + 1) as usize;
    let mut series = HourlySeries {
        start: first,
        cpu: Vec::with_capacity(steps),
        mem: Vec::with_capacity(steps),
    };

    let (mut cpu, mut mem) = (0.0, 0.0);
    for i in 0..steps {
        if let Some((cpu_sum, mem_sum, n)) = buckets.get(&series.bucket_at(i)) {
            cpu = cpu_sum / *n as f64;
            mem = mem_sum / *n as f64;
        }
        series.cpu.push(cpu);
        series.mem.push(mem);
    }
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityId;

    fn sample(ts: i64, cpu: f64) -> MetricSample {
        MetricSample {
            entity_id: EntityId::host("pve1"),
            timestamp: ts,
            cpu_pct: cpu,
            mem_pct: cpu / 2.0,
            disk_used: 0,
            net_in: 0,
            net_out: 0,
            status: "online".to_string(),
        }
    }

    #[test]
    fn test_mean_within_hour() {
        let series = resample_hourly(&[sample(7200, 10.0), sample(7230, 30.0), sample(10800, 50.0)]);
        assert_eq!(series.start, 7200);
        assert_eq!(series.cpu, vec![20.0, 50.0]);
        assert_eq!(series.mem, vec![10.0, 25.0]);
        assert_eq!(series.last_bucket(), Some(10800));
    }

    #[test]
    fn test_gaps_forward_filled() {
        let series = resample_hourly(&[sample(0, 10.0), sample(3 * 3600 + 5, 40.0)]);
        assert_eq!(series.cpu, vec![10.0, 10.0, 10.0, 40.0]);
    }

    #[test]
    fn test_unsorted_input_and_empty() {
        let series = resample_hourly(&[sample(3600, 2.0), sample(0, 1.0)]);
        assert_eq!(series.cpu, vec![1.0, 2.0]);
        assert!(resample_hourly(&[]).is_empty());
        assert_eq!(resample_hourly(&[]).last_bucket(), None);
    }
}
