use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::types::Event;

// Recognition patterns for the important slow log lines. Compiled once and
// shared by every parser instance; none of them capture caller state.
static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#\s+[A-Z]").unwrap());
static TIME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Time: (\S+\s{1,2}\S+)").unwrap());
static USER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"User@Host: ([^\[]+|\[[^\[]+\]).*?@ (\S*) \[(.*)\]").unwrap());
static SCHEMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Schema: +(.*?) +Last_errno:").unwrap());
static METRICS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\w+): (\S+|$)").unwrap());
static ADMIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"command: (.+)").unwrap());
static SET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SET (?:last_insert_id|insert_id|timestamp)").unwrap());
static USE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^use ").unwrap());
static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/\*(.*?)\*/").unwrap());
static COMMENT_PAIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+)=([^\s,]+)").unwrap());

/// a header line is a `#` followed by whitespace and an uppercase letter
pub(crate) fn is_header_line(line: &str) -> bool {
    HEADER_RE.is_match(line)
}

/// Meta lines the server writes around events, e.g. on restart:
///
/// ```text
/// /usr/local/bin/mysqld, Version: 5.6.15-62.0 (binary). started with:
/// Tcp port: 3306  Unix socket: /var/lib/mysql/mysql.sock
/// Time                 Id Command    Argument
/// ```
///
/// Checked against the raw line, terminator included.
pub(crate) fn is_meta_line(raw: &[u8]) -> bool {
    raw.len() >= 20
        && ((raw[0] == b'/' && raw.ends_with(b"with:\n"))
            || raw.starts_with(b"Time ")
            || raw.starts_with(b"Tcp ")
            || raw.starts_with(b"TCP "))
}

/// extracts the raw timestamp from a `# Time:` line
pub(crate) fn parse_time(line: &str) -> Option<&str> {
    TIME_RE.captures(line).map(|c| c.get(1).unwrap().as_str())
}

/// extracts `(user, host)` from a `# User@Host:` line
pub(crate) fn parse_user_host(line: &str) -> Option<(&str, &str)> {
    USER_RE
        .captures(line)
        .map(|c| (c.get(1).unwrap().as_str(), c.get(2).unwrap().as_str()))
}

/// extracts the database from the `Schema: <db>  Last_errno:` header shape
pub(crate) fn parse_schema(line: &str) -> Option<&str> {
    SCHEMA_RE.captures(line).map(|c| c.get(1).unwrap().as_str())
}

/// Scans a header line for `name: value` metric pairs and dispatches each
/// one onto the event by name and value shape. Unparseable numbers degrade
/// to zero; the parser never fails an event over a bad metric.
pub(crate) fn scan_metrics(line: &str, event: &mut Event) {
    for caps in METRICS_RE.captures_iter(line) {
        let name = caps.get(1).unwrap().as_str();
        let value = caps.get(2).unwrap().as_str();

        if name.ends_with("_time") || name.ends_with("_wait") {
            // microsecond value, logged at single precision
            let val = value.parse::<f32>().unwrap_or(0.0);
            event.time_metrics.insert(name.to_string(), val as f64);
        } else if value == "Yes" || value == "No" {
            event.bool_metrics.insert(name.to_string(), value == "Yes");
        } else if name == "Schema" {
            event.db = value.to_string();
        } else if name == "Log_slow_rate_type" {
            event.rate_type = value.to_string();
        } else if name == "Log_slow_rate_limit" {
            event.rate_limit = value.parse().unwrap_or(0);
        } else if name == "InnoDB_trx_id" {
            continue; // ignore
        } else {
            event
                .number_metrics
                .insert(name.to_string(), value.parse().unwrap_or(0));
        }
    }
}

/// extracts the command name from a `# administrator command: <name>;` line,
/// trailing `;` stripped so admin filters can compare exactly
pub(crate) fn parse_admin_command(line: &str) -> Option<&str> {
    ADMIN_RE
        .captures(line)
        .map(|c| c.get(1).unwrap().as_str().trim_end_matches(';'))
}

/// Extracts the database name from a `use <db>;` query line, if this is one.
/// Trailing `;` and wrapping backticks are trimmed.
pub(crate) fn parse_use_db(line: &str) -> Option<&str> {
    USE_RE
        .find(line)
        .map(|m| line[m.end()..].trim_end_matches(';').trim_matches('`'))
}

/// `SET last_insert_id|insert_id|timestamp` lines are session bookkeeping,
/// not part of the query
pub(crate) fn is_filtered_set_line(line: &str) -> bool {
    SET_RE.is_match(line)
}

/// Lifts `key=value` annotations out of `/* ... */` comments on a query
/// line, e.g. `/* caller=checkout, request_id=abc123 */`.
pub(crate) fn scan_comment_metadata(line: &str, metadata: &mut HashMap<String, String>) {
    for comment in COMMENT_RE.captures_iter(line) {
        let body = comment.get(1).unwrap().as_str();
        for pair in COMMENT_PAIR_RE.captures_iter(body) {
            metadata.insert(pair[1].to_string(), pair[2].to_string());
        }
    }
}
