use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Duration, Month, PrimitiveDateTime, Time};

use crate::class::Class;
use crate::types::Event;

const EXAMPLE_TS_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// A global class and per-id classes with finalized metric statistics,
/// keyed on class id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogResult {
    pub global: Class,
    pub classes: HashMap<String, Class>,
    pub rate_limit: u64,
}

/// Groups events by class id. When there are no more events, a call to
/// [`finalize`](Self::finalize) computes all metric statistics and returns
/// a [`LogResult`].
#[derive(Debug)]
pub struct Aggregator {
    samples: bool,
    utc_offset: Duration,
    outlier_time: f64,
    global: Class,
    classes: HashMap<String, Class>,
    rate_limit: u64,
}

impl Aggregator {
    /// Returns a new aggregator. If `samples` is true, each class retains
    /// its slowest query as an example. Events whose `Query_time` exceeds
    /// `outlier_time` (when positive) are counted as outliers. `utc_offset`
    /// is applied to example timestamps at finalize.
    pub fn new(samples: bool, utc_offset: Duration, outlier_time: f64) -> Self {
        Self {
            samples,
            utc_offset,
            outlier_time,
            global: Class::new("", "", false),
            classes: HashMap::new(),
            rate_limit: 0,
        }
    }

    /// Adds the event to its class, creating the class on first sight.
    /// The caller supplies the class id and fingerprint of the query.
    pub fn add_event(&mut self, event: &Event, id: &str, fingerprint: &str) {
        // Only the last seen rate limit is reported; a log with mixed rate
        // limits is not modelled.
        if self.rate_limit != event.rate_limit {
            debug!("rate limit {} -> {}", self.rate_limit, event.rate_limit);
            self.rate_limit = event.rate_limit;
        }

        let outlier =
            self.outlier_time > 0.0 && event.query_time().unwrap_or(0.0) > self.outlier_time;

        self.global.add_event(event, outlier);

        let class = self
            .classes
            .entry(id.to_string())
            .or_insert_with(|| Class::new(id, fingerprint, self.samples));
        class.add_event(event, outlier);
    }

    /// Computes all metric statistics and returns the result. Consumes the
    /// aggregator: a class is finalized exactly once.
    pub fn finalize(mut self) -> LogResult {
        self.global.finalize(self.rate_limit);
        self.global.unique_queries = self.classes.len() as u64;

        for class in self.classes.values_mut() {
            class.finalize(self.rate_limit);
            class.unique_queries = 1;

            if let Some(example) = class.example.as_mut() {
                if !example.ts.is_empty() {
                    example.ts = match encode_example_ts(&example.ts, self.utc_offset) {
                        Some(ts) => ts,
                        None => String::new(),
                    };
                }
            }
        }

        LogResult {
            global: self.global,
            classes: self.classes,
            rate_limit: self.rate_limit,
        }
    }
}

/// Re-encodes a raw `YYMMDD HH:MM:SS` slow log timestamp as
/// `YYYY-MM-DD HH:MM:SS`, with the UTC offset applied. Two-digit years
/// resolve to 2000-2099. The log pads single-digit hours with a space.
fn encode_example_ts(ts: &str, utc_offset: Duration) -> Option<String> {
    let (date_part, time_part) = ts.split_once(' ')?;
    let time_part = time_part.trim_start();

    if date_part.len() != 6 || !date_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = date_part[..2].parse().ok()?;
    let month: u8 = date_part[2..4].parse().ok()?;
    let day: u8 = date_part[4..6].parse().ok()?;
    let date = Date::from_calendar_date(2000 + year, Month::try_from(month).ok()?, day).ok()?;

    let mut parts = time_part.splitn(3, ':');
    let hour: u8 = parts.next()?.parse().ok()?;
    let minute: u8 = parts.next()?.parse().ok()?;
    let second: u8 = parts.next()?.parse().ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;

    let adjusted = PrimitiveDateTime::new(date, time).checked_add(utc_offset)?;
    adjusted.format(EXAMPLE_TS_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use time::Duration;

    use crate::aggregator::{encode_example_ts, Aggregator};
    use crate::types::Event;

    fn event(query_time: f64, query: &str, ts: &str) -> Event {
        Event {
            ts: ts.to_string(),
            query: query.to_string(),
            time_metrics: HashMap::from([("Query_time".to_string(), query_time)]),
            number_metrics: HashMap::from([("Rows_sent".to_string(), 1)]),
            ..Default::default()
        }
    }

    fn assert_close(got: f64, want: f64) {
        assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
    }

    #[test]
    fn groups_events_into_classes() {
        let mut aggregator = Aggregator::new(true, Duration::ZERO, 0.0);
        aggregator.add_event(&event(2.0, "select sleep(2) from n", ""), "1", "select sleep(?) from n");
        aggregator.add_event(&event(4.0, "select sleep(4) from n", ""), "1", "select sleep(?) from n");
        aggregator.add_event(&event(1.0, "insert into t values (1)", ""), "2", "insert into t values (?)");

        let result = aggregator.finalize();

        assert_eq!(result.global.total_queries, 3);
        assert_eq!(result.global.unique_queries, 2);
        assert!(result.global.example.is_none());

        let select = &result.classes["1"];
        assert_eq!(select.fingerprint, "select sleep(?) from n");
        assert_eq!(select.total_queries, 2);
        assert_eq!(select.unique_queries, 1);
        assert_close(select.metrics.time_metrics["Query_time"].sum, 6.0);
        assert_eq!(select.example.as_ref().unwrap().query, "select sleep(4) from n");

        let insert = &result.classes["2"];
        assert_eq!(insert.total_queries, 1);

        // global totals are the sum of per-class totals
        assert_eq!(
            result.global.total_queries,
            result.classes.values().map(|c| c.total_queries).sum::<u64>()
        );
    }

    #[test]
    fn outlier_threshold_splits_sums() {
        let mut aggregator = Aggregator::new(false, Duration::ZERO, 10.0);
        aggregator.add_event(&event(2.0, "select c from t", ""), "1", "select c from t");
        aggregator.add_event(&event(2.0, "select c from t", ""), "1", "select c from t");
        aggregator.add_event(&event(12.0, "select c from t", ""), "1", "select c from t");

        let result = aggregator.finalize();
        let class = &result.classes["1"];

        // 2 normal * rate limit 1 + 1 outlier
        assert_eq!(class.total_queries, 3);
        let qt = &class.metrics.time_metrics["Query_time"];
        assert_close(qt.sum, 16.0);
        assert_close(qt.avg, 16.0 / 3.0);
        assert_close(qt.max, 12.0);
    }

    #[test]
    fn rate_limit_scales_all_classes() {
        let mut aggregator = Aggregator::new(false, Duration::ZERO, 0.0);
        for _ in 0..3 {
            let mut ev = event(2.0, "SELECT foo FROM bar", "");
            ev.rate_type = "query".to_string();
            ev.rate_limit = 2;
            aggregator.add_event(&ev, "1", "select foo from bar");
        }

        let result = aggregator.finalize();

        assert_eq!(result.rate_limit, 2);
        assert_eq!(result.classes["1"].total_queries, 6);
        assert_eq!(result.global.total_queries, 6);
        assert_close(
            result.classes["1"].metrics.time_metrics["Query_time"].sum,
            12.0,
        );
    }

    #[test]
    fn reports_last_observed_rate_limit() {
        let mut aggregator = Aggregator::new(false, Duration::ZERO, 0.0);
        let mut limited = event(1.0, "select 1", "");
        limited.rate_limit = 10;
        aggregator.add_event(&limited, "1", "select ?");
        aggregator.add_event(&event(1.0, "select 2", ""), "1", "select ?");

        // the unannotated event resets the tracked limit to zero
        let result = aggregator.finalize();
        assert_eq!(result.rate_limit, 0);
        assert_eq!(result.classes["1"].total_queries, 2);
    }

    #[test]
    fn example_ts_is_reencoded() {
        let mut aggregator = Aggregator::new(true, Duration::ZERO, 0.0);
        aggregator.add_event(
            &event(2.0, "select sleep(2) from n", "071015 21:43:52"),
            "1",
            "select sleep(?) from n",
        );

        let result = aggregator.finalize();
        assert_eq!(
            result.classes["1"].example.as_ref().unwrap().ts,
            "2007-10-15 21:43:52"
        );
    }

    #[test]
    fn example_ts_honors_utc_offset() {
        let mut aggregator = Aggregator::new(true, Duration::hours(-1), 0.0);
        aggregator.add_event(
            &event(2.0, "select sleep(2) from n", "071015 21:43:52"),
            "1",
            "select sleep(?) from n",
        );

        let result = aggregator.finalize();
        assert_eq!(
            result.classes["1"].example.as_ref().unwrap().ts,
            "2007-10-15 20:43:52"
        );
    }

    #[test]
    fn unparseable_example_ts_is_cleared() {
        let mut aggregator = Aggregator::new(true, Duration::ZERO, 0.0);
        aggregator.add_event(
            &event(2.0, "select sleep(2) from n", "2015-06-26T16:43:23"),
            "1",
            "select sleep(?) from n",
        );

        let result = aggregator.finalize();
        assert_eq!(result.classes["1"].example.as_ref().unwrap().ts, "");
    }

    #[test]
    fn encodes_space_padded_hours() {
        assert_eq!(
            encode_example_ts("131128  1:05:31", Duration::ZERO),
            Some("2013-11-28 01:05:31".to_string())
        );
    }

    #[test]
    fn rejects_malformed_dates() {
        assert_eq!(encode_example_ts("7-10-15 21:43:52", Duration::ZERO), None);
        assert_eq!(encode_example_ts("071315 21:43:52", Duration::ZERO), None);
        assert_eq!(encode_example_ts("071015", Duration::ZERO), None);
    }
}
