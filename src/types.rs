use std::collections::HashMap;

/// A single slow log event: a query like `SELECT col FROM t WHERE id = 1`,
/// some metrics like `Query_time`, and metadata such as the default database
/// and the raw timestamp. Metrics and metadata are not guaranteed to be
/// present — frequently they are not — but every emitted event carries at
/// least the query and the `Query_time` metric. Everything else varies with
/// the MySQL version, distro and configuration that wrote the log.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Event {
    /// byte offset in the source at which the event's first header line begins
    pub offset: u64,
    /// raw timestamp as it appeared in the log, e.g. `071015 21:43:52`
    pub ts: String,
    /// true if the query is an administrator command
    pub admin: bool,
    /// SQL text (interior newlines preserved) or the admin command name
    pub query: String,
    /// MySQL user, empty if absent
    pub user: String,
    /// client host, empty if absent
    pub host: String,
    /// default database, empty if absent
    pub db: String,
    /// `*_time` and `*_wait` metrics
    pub time_metrics: HashMap<String, f64>,
    /// most metrics
    pub number_metrics: HashMap<String, u64>,
    /// Yes/No metrics
    pub bool_metrics: HashMap<String, bool>,
    /// Percona Server rate limit type
    pub rate_type: String,
    /// Percona Server rate limit value, zero if absent
    pub rate_limit: u64,
    /// key=value pairs lifted from /* ... */ annotations in the query
    pub comment_metadata: HashMap<String, String>,
}

impl Event {
    /// returns the `Query_time` metric, if the event carries one
    pub fn query_time(&self) -> Option<f64> {
        self.time_metrics.get("Query_time").copied()
    }
}
