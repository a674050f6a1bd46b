use std::mem;

use bytes::BytesMut;
use log::{debug, trace};
use tokio_util::codec::Decoder;

use crate::parser::{
    is_filtered_set_line, is_header_line, is_meta_line, parse_admin_command, parse_schema,
    parse_time, parse_use_db, parse_user_host, scan_comment_metadata, scan_metrics,
};
use crate::types::Event;
use crate::{ParseError, ParseOptions};

/// Where the decoder is within the log. Event boundaries are implicit: a
/// header line while a query is being accumulated closes the event.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
enum State {
    #[default]
    Idle,
    InHeader,
    InQuery,
}

/// Incremental slow log decoder. Feed it raw bytes through a
/// [`tokio_util::codec::FramedRead`] and it yields one [`Event`] per log
/// entry, reconstructing boundaries from the header line pattern. Lines may
/// be arbitrarily long; partial reads are handled by the framing layer.
#[derive(Debug, Default)]
pub struct EventCodec {
    opt: ParseOptions,
    state: State,
    event: Event,
    header_lines: u64,
    query_lines: u64,
    bytes_read: u64,
    line_offset: u64,
    // resume point for the newline scan, so a long unterminated line is not
    // rescanned from the start on every read
    next_index: usize,
}

impl EventCodec {
    pub fn new(opt: ParseOptions) -> Self {
        Self {
            bytes_read: opt.start_offset,
            opt,
            ..Default::default()
        }
    }

    /// Consumes one raw line, terminator included, and returns an event if
    /// this line completed one.
    fn line(&mut self, raw: &[u8]) -> Result<Option<Event>, ParseError> {
        let line_len = raw.len() as u64;
        self.bytes_read += line_len;
        self.line_offset = self.bytes_read - line_len;
        if self.line_offset != 0 {
            // off-by-one carried over from the original offset accounting;
            // downstream consumers store and resume on these values
            self.line_offset += 1;
        }

        if is_meta_line(raw) {
            trace!("meta line at {}", self.line_offset);
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();

        match self.state {
            State::InHeader => self.header_line(&line),
            State::InQuery => self.query_line(&line),
            State::Idle => {
                if is_header_line(&line) {
                    self.state = State::InHeader;
                    self.header_line(&line)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn header_line(&mut self, line: &str) -> Result<Option<Event>, ParseError> {
        if !is_header_line(line) {
            self.state = State::InQuery;
            return self.query_line(line);
        }

        if self.header_lines == 0 {
            self.event.offset = self.line_offset;
        }
        self.header_lines += 1;

        if line.starts_with("# Time") {
            let Some(ts) = parse_time(line) else {
                return Ok(None);
            };
            self.event.ts = ts.to_string();
            // old format wedges the user clause onto the time line
            if let Some((user, host)) = parse_user_host(line) {
                self.event.user = user.to_string();
                self.event.host = host.to_string();
            }
        } else if line.starts_with("# User") {
            let Some((user, host)) = parse_user_host(line) else {
                return Ok(None);
            };
            self.event.user = user.to_string();
            self.event.host = host.to_string();
        } else if line.starts_with("# admin") {
            return self.admin_line(line);
        } else {
            if let Some(db) = parse_schema(line) {
                self.event.db = db.to_string();
            }
            scan_metrics(line, &mut self.event);
        }

        Ok(None)
    }

    fn query_line(&mut self, line: &str) -> Result<Option<Event>, ParseError> {
        if line.starts_with("# admin") {
            return self.admin_line(line);
        }

        if is_header_line(line) {
            debug!("next event at {}", self.line_offset);
            let event = self.take_event(State::InHeader)?;
            self.header_line(line)?;
            return Ok(event);
        }

        if self.query_lines == 0 {
            if let Some(db) = parse_use_db(line) {
                self.event.db = db.to_string();
                // Keep the use statement as the query for now; a statement on
                // a later line replaces it, and a bare `use db` stays as the
                // query in its own right.
                self.event.query = line.to_string();
                return Ok(None);
            }
        }

        if is_filtered_set_line(line) {
            return Ok(None);
        }

        if self.query_lines > 0 {
            self.event.query.push('\n');
            self.event.query.push_str(line);
        } else {
            self.event.query = line.to_string();
        }
        scan_comment_metadata(line, &mut self.event.comment_metadata);
        self.query_lines += 1;

        Ok(None)
    }

    /// Admin commands are always the terminal line of their event, so the
    /// event is emitted (or filtered) right here.
    fn admin_line(&mut self, line: &str) -> Result<Option<Event>, ParseError> {
        self.event.admin = true;
        if let Some(command) = parse_admin_command(line) {
            self.event.query = command.to_string();
        }

        if self.opt.filter_admin_command.contains(&self.event.query) {
            debug!("filtered admin command {:?}", self.event.query);
            self.event = Event::default();
            self.header_lines = 0;
            self.query_lines = 0;
            self.state = State::Idle;
            return Ok(None);
        }

        self.take_event(State::Idle)
    }

    /// Closes out the in-progress event and resets per-event state, leaving
    /// the decoder in `next` for the line that triggered the close.
    fn take_event(&mut self, next: State) -> Result<Option<Event>, ParseError> {
        let header_lines = self.header_lines;
        self.header_lines = 0;
        self.query_lines = 0;
        self.state = next;

        let mut event = mem::take(&mut self.event);

        if !event.time_metrics.contains_key("Query_time") {
            if header_lines > 0 {
                // Parsing started mid-event, past the Query_time line.
                // Throw the fragment away.
                debug!("discarding partial event at {}", event.offset);
                return Ok(None);
            }
            return Err(ParseError::MissingQueryTime {
                offset: self.line_offset,
            });
        }

        if event.db.ends_with(";\n") {
            event.db.truncate(event.db.len() - 2);
        }
        if event.query.ends_with(';') {
            event.query.pop();
        }

        Ok(Some(event))
    }
}

impl Decoder for EventCodec {
    type Item = Event;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Event>, ParseError> {
        loop {
            let Some(pos) = src[self.next_index..].iter().position(|&b| b == b'\n') else {
                self.next_index = src.len();
                return Ok(None);
            };

            let line = src.split_to(self.next_index + pos + 1);
            self.next_index = 0;

            if let Some(event) = self.line(&line)? {
                return Ok(Some(event));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Event>, ParseError> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }

        // A final line without a terminator is an unfinished write; drop it.
        src.clear();
        self.next_index = 0;

        if self.query_lines > 0 {
            return self.take_event(State::Idle);
        }

        Ok(None)
    }
}
