use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Event;

/// The statistics of one event class, per metric. The three metric families
/// are disjoint universes with their own stats shape: times get float
/// percentiles, counters get integer ones, booleans only count.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub time_metrics: HashMap<String, TimeStats>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub number_metrics: HashMap<String, NumberStats>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub bool_metrics: HashMap<String, BoolStats>,
}

/// Microsecond-based metrics like `Query_time` and `Lock_time`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeStats {
    #[serde(skip)]
    vals: Vec<f64>,
    pub sum: f64,
    pub min: f64,
    pub avg: f64,
    /// median (50th percentile)
    pub med: f64,
    /// 95th percentile
    pub p95: f64,
    pub max: f64,
    #[serde(skip)]
    outlier_sum: f64,
}

/// Integer-based metrics like `Rows_sent` and `Merge_passes`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberStats {
    #[serde(skip)]
    vals: Vec<u64>,
    pub sum: u64,
    pub min: u64,
    pub avg: u64,
    /// median (50th percentile)
    pub med: u64,
    /// 95th percentile
    pub p95: u64,
    pub max: u64,
    #[serde(skip)]
    outlier_sum: u64,
}

/// Boolean metrics like `QC_Hit` and `Filesort`; true rate = sum / count.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolStats {
    pub sum: u64,
    #[serde(skip)]
    outlier_sum: u64,
}

impl Metrics {
    /// Saves all the metrics of the event. Outlier events feed a separate
    /// sum that is exempt from rate limit scaling at finalize.
    pub fn add_event(&mut self, event: &Event, outlier: bool) {
        for (metric, &val) in &event.time_metrics {
            let stats = self.time_metrics.entry(metric.clone()).or_default();
            if outlier {
                stats.outlier_sum += val;
            } else {
                stats.sum += val;
            }
            stats.vals.push(val);
        }

        for (metric, &val) in &event.number_metrics {
            let stats = self.number_metrics.entry(metric.clone()).or_default();
            if outlier {
                stats.outlier_sum += val;
            } else {
                stats.sum += val;
            }
            stats.vals.push(val);
        }

        for (metric, &val) in &event.bool_metrics {
            let stats = self.bool_metrics.entry(metric.clone()).or_default();
            if val {
                if outlier {
                    stats.outlier_sum += 1;
                } else {
                    stats.sum += 1;
                }
            }
        }
    }

    /// Computes the statistics of the added metrics. Call once, when done
    /// adding events. Percentiles are nearest-rank: the sorted buffer is
    /// indexed at `(p * cnt) / 100` with integer division.
    pub fn finalize(&mut self, rate_limit: u64) {
        let rate_limit = rate_limit.max(1);

        for stats in self.time_metrics.values_mut() {
            stats.vals.sort_by(f64::total_cmp);
            let cnt = stats.vals.len();

            stats.min = stats.vals[0];
            stats.avg = (stats.sum + stats.outlier_sum) / cnt as f64;
            stats.med = stats.vals[(50 * cnt) / 100];
            stats.p95 = stats.vals[(95 * cnt) / 100];
            stats.max = stats.vals[cnt - 1];

            // sum last: avg above wants the unscaled value
            stats.sum = (stats.sum * rate_limit as f64) + stats.outlier_sum;
        }

        for stats in self.number_metrics.values_mut() {
            stats.vals.sort_unstable();
            let cnt = stats.vals.len();

            stats.min = stats.vals[0];
            stats.avg = (stats.sum + stats.outlier_sum) / cnt as u64;
            stats.med = stats.vals[(50 * cnt) / 100];
            stats.p95 = stats.vals[(95 * cnt) / 100];
            stats.max = stats.vals[cnt - 1];

            // sum last: avg above wants the unscaled value
            stats.sum = (stats.sum * rate_limit) + stats.outlier_sum;
        }

        for stats in self.bool_metrics.values_mut() {
            stats.sum = (stats.sum * rate_limit) + stats.outlier_sum;
        }
    }
}

impl TimeStats {
    /// stats seeded with already-finalized values, for merge tests and
    /// result reconstruction
    pub fn with_values(sum: f64, min: f64, avg: f64, med: f64, p95: f64, max: f64) -> Self {
        Self {
            sum,
            min,
            avg,
            med,
            p95,
            max,
            ..Default::default()
        }
    }
}

impl NumberStats {
    /// stats seeded with already-finalized values, for merge tests and
    /// result reconstruction
    pub fn with_values(sum: u64, min: u64, avg: u64, med: u64, p95: u64, max: u64) -> Self {
        Self {
            sum,
            min,
            avg,
            med,
            p95,
            max,
            ..Default::default()
        }
    }
}

impl BoolStats {
    pub fn with_sum(sum: u64) -> Self {
        Self {
            sum,
            outlier_sum: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::metrics::Metrics;
    use crate::types::Event;

    fn event_with_query_time(val: f64) -> Event {
        Event {
            time_metrics: HashMap::from([("Query_time".to_string(), val)]),
            number_metrics: HashMap::from([("Rows_sent".to_string(), val as u64)]),
            ..Default::default()
        }
    }

    fn assert_close(got: f64, want: f64) {
        assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
    }

    #[test]
    fn finalizes_basic_stats() {
        let mut metrics = Metrics::default();
        for val in [3.0, 1.0, 5.0, 2.0, 4.0] {
            metrics.add_event(&event_with_query_time(val), false);
        }
        metrics.finalize(0);

        let qt = &metrics.time_metrics["Query_time"];
        assert_close(qt.sum, 15.0);
        assert_close(qt.min, 1.0);
        assert_close(qt.avg, 3.0);
        assert_close(qt.med, 3.0); // vals[(50*5)/100] = vals[2]
        assert_close(qt.p95, 5.0); // vals[(95*5)/100] = vals[4]
        assert_close(qt.max, 5.0);

        let rs = &metrics.number_metrics["Rows_sent"];
        assert_eq!(rs.sum, 15);
        assert_eq!(rs.min, 1);
        assert_eq!(rs.avg, 3);
        assert_eq!(rs.med, 3);
        assert_eq!(rs.p95, 5);
        assert_eq!(rs.max, 5);
    }

    #[test]
    fn percentile_index_is_nearest_rank() {
        let mut metrics = Metrics::default();
        for val in 1..=10 {
            metrics.add_event(&event_with_query_time(val as f64), false);
        }
        metrics.finalize(0);

        let qt = &metrics.time_metrics["Query_time"];
        // (50*10)/100 = index 5 in ascending order, not the interpolated 5.5
        assert_close(qt.med, 6.0);
        // (95*10)/100 = index 9
        assert_close(qt.p95, 10.0);
        let rs = &metrics.number_metrics["Rows_sent"];
        assert_eq!(rs.med, 6);
        assert_eq!(rs.p95, 10);
    }

    #[test]
    fn single_observation_stats() {
        let mut metrics = Metrics::default();
        metrics.add_event(&event_with_query_time(2.0), false);
        metrics.finalize(0);

        let qt = &metrics.time_metrics["Query_time"];
        assert_close(qt.min, 2.0);
        assert_close(qt.med, 2.0);
        assert_close(qt.p95, 2.0);
        assert_close(qt.max, 2.0);
    }

    #[test]
    fn outlier_sum_is_not_rate_scaled() {
        let mut metrics = Metrics::default();
        metrics.add_event(&event_with_query_time(1.0), false);
        metrics.add_event(&event_with_query_time(3.0), false);
        metrics.add_event(&event_with_query_time(20.0), true);
        metrics.finalize(2);

        let qt = &metrics.time_metrics["Query_time"];
        // avg uses the unscaled sums: (4 + 20) / 3
        assert_close(qt.avg, 8.0);
        // normal sum doubles under the rate limit, the outlier counts once
        assert_close(qt.sum, 4.0 * 2.0 + 20.0);
        assert_close(qt.min, 1.0);
        assert_close(qt.max, 20.0);

        let rs = &metrics.number_metrics["Rows_sent"];
        assert_eq!(rs.avg, (4 + 20) / 3);
        assert_eq!(rs.sum, 4 * 2 + 20);
    }

    #[test]
    fn accumulation_is_order_independent() {
        let vals = [(1.0, false), (3.0, false), (20.0, true)];

        let mut forward = Metrics::default();
        for &(val, outlier) in &vals {
            forward.add_event(&event_with_query_time(val), outlier);
        }
        forward.finalize(2);

        let mut reverse = Metrics::default();
        for &(val, outlier) in vals.iter().rev() {
            reverse.add_event(&event_with_query_time(val), outlier);
        }
        reverse.finalize(2);

        assert_eq!(forward, reverse);
    }

    #[test]
    fn bool_metrics_count_true_observations() {
        let mut metrics = Metrics::default();
        for full_scan in [true, false, true, true] {
            let event = Event {
                time_metrics: HashMap::from([("Query_time".to_string(), 1.0)]),
                bool_metrics: HashMap::from([("Full_scan".to_string(), full_scan)]),
                ..Default::default()
            };
            metrics.add_event(&event, false);
        }
        metrics.finalize(0);

        assert_eq!(metrics.bool_metrics["Full_scan"].sum, 3);
    }

    #[test]
    fn bool_sum_scales_with_rate_limit() {
        let mut metrics = Metrics::default();
        let event = Event {
            time_metrics: HashMap::from([("Query_time".to_string(), 1.0)]),
            bool_metrics: HashMap::from([("Filesort".to_string(), true)]),
            ..Default::default()
        };
        metrics.add_event(&event, false);
        metrics.add_event(&event, true);
        metrics.finalize(10);

        // one normal observation scaled by 10, one outlier counted once
        assert_eq!(metrics.bool_metrics["Filesort"].sum, 11);
    }

    #[test]
    fn empty_bool_map_is_omitted_from_serialization() {
        let mut metrics = Metrics::default();
        metrics.add_event(&event_with_query_time(1.0), false);
        metrics.finalize(0);

        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json.get("time_metrics").is_some());
        assert!(json.get("bool_metrics").is_none());
    }
}
