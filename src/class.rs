use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::metrics::Metrics;
use crate::types::Event;

/// Example queries longer than this are truncated and marked with `...`.
pub const MAX_EXAMPLE_BYTES: usize = 1024 * 10;

/// All events with the same fingerprint and class id. Only enforced by
/// convention — be careful not to mix events from different classes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Class {
    /// opaque checksum of the fingerprint, supplied by the caller
    pub id: String,
    /// canonical form of the query, supplied by the caller
    pub fingerprint: String,
    /// statistics for each metric, e.g. max `Query_time`
    pub metrics: Metrics,
    /// total number of queries in the class
    pub total_queries: u64,
    /// number of distinct class ids (1 for a leaf class)
    pub unique_queries: u64,
    /// sample query with the maximum `Query_time`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<Example>,
    /// comment annotations of the maximum-time event
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub max_query_comment_metadata: HashMap<String, String>,
    #[serde(skip)]
    outliers: u64,
    #[serde(skip)]
    last_db: String,
    #[serde(skip)]
    sample: bool,
}

/// A real query with its database, timestamp and `Query_time`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub query_time: f64,
    pub db: String,
    /// truncated to [`MAX_EXAMPLE_BYTES`]
    pub query: String,
    pub ts: String,
}

impl Class {
    /// Returns a new class for the id and fingerprint. If `sample` is true,
    /// the query with the greatest `Query_time` is retained.
    pub fn new(id: &str, fingerprint: &str, sample: bool) -> Self {
        Self {
            id: id.to_string(),
            fingerprint: fingerprint.to_string(),
            example: Some(Example::default()),
            sample,
            ..Default::default()
        }
    }

    /// Adds an event to the class.
    pub fn add_event(&mut self, event: &Event, outlier: bool) {
        if outlier {
            self.outliers += 1;
        } else {
            self.total_queries += 1;
        }

        self.metrics.add_event(event, outlier);

        // Remember the last db seen so a sample query picked from an event
        // without one still gets a db.
        if !event.db.is_empty() {
            self.last_db = event.db.clone();
        }

        if self.sample {
            if let Some(query_time) = event.query_time() {
                let current = self.example.as_ref().map_or(0.0, |e| e.query_time);
                if query_time > current {
                    let example = self.example.get_or_insert_with(Example::default);
                    example.query_time = query_time;
                    example.db = if !event.db.is_empty() {
                        event.db.clone()
                    } else {
                        self.last_db.clone()
                    };
                    example.query = truncate_example(&event.query);
                    example.ts = event.ts.clone();
                    self.max_query_comment_metadata = event.comment_metadata.clone();
                }
            }
        }
    }

    /// Computes all metric statistics. Call once, when done adding events.
    pub fn finalize(&mut self, rate_limit: u64) {
        let rate_limit = rate_limit.max(1);
        self.metrics.finalize(rate_limit);
        self.total_queries = (self.total_queries * rate_limit) + self.outliers;
        if self.example.as_ref().map_or(false, |e| e.query_time == 0.0) {
            self.example = None;
        }
    }

    /// Merges already-finalized classes into a single class under a new id
    /// and fingerprint, e.g. to report several fingerprints as one group.
    ///
    /// Sums and min/max merge exactly. The merged `avg` divides the merged
    /// sum by the merged total, and percentiles carry over from the first
    /// member seen — neither can be recomputed without the original value
    /// buffers.
    pub fn aggregate(id: &str, fingerprint: &str, members: &[Class]) -> Self {
        let mut class = Class {
            id: id.to_string(),
            fingerprint: fingerprint.to_string(),
            total_queries: members.iter().map(|m| m.total_queries).sum(),
            unique_queries: members.len() as u64,
            example: None,
            ..Default::default()
        };

        for member in members {
            for (name, stats) in &member.metrics.time_metrics {
                match class.metrics.time_metrics.entry(name.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(stats.clone());
                    }
                    Entry::Occupied(mut slot) => {
                        let merged = slot.get_mut();
                        merged.sum += stats.sum;
                        merged.avg = merged.sum / class.total_queries as f64;
                        merged.min = merged.min.min(stats.min);
                        merged.max = merged.max.max(stats.max);
                    }
                }
            }

            for (name, stats) in &member.metrics.number_metrics {
                match class.metrics.number_metrics.entry(name.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(stats.clone());
                    }
                    Entry::Occupied(mut slot) => {
                        let merged = slot.get_mut();
                        merged.sum += stats.sum;
                        merged.avg = merged.sum / class.total_queries;
                        merged.min = merged.min.min(stats.min);
                        merged.max = merged.max.max(stats.max);
                    }
                }
            }

            for (name, stats) in &member.metrics.bool_metrics {
                match class.metrics.bool_metrics.entry(name.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(stats.clone());
                    }
                    Entry::Occupied(mut slot) => {
                        slot.get_mut().sum += stats.sum;
                    }
                }
            }
        }

        class
    }
}

fn truncate_example(query: &str) -> String {
    if query.len() <= MAX_EXAMPLE_BYTES {
        return query.to_string();
    }

    let mut end = MAX_EXAMPLE_BYTES - 3;
    while !query.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &query[..end])
}
