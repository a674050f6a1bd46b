//! Streaming MySQL slow query log parsing and per-fingerprint statistics.
//!
//! The slow log is a semi-structured, append-only text file with no explicit
//! event delimiters; boundaries are inferred from `#`-prefixed header lines.
//! [`LogParser`] reconstructs discrete [`Event`]s from any async byte source,
//! tolerating multi-line queries, server meta lines, partial reads and
//! resumption from an arbitrary byte offset. [`Aggregator`] groups the events
//! by a caller-supplied query fingerprint into [`Class`]es and computes
//! streaming statistics over time, counter and boolean metrics.
//!
//! Fingerprinting itself is left to the caller: feed each event's query text
//! through your canonicalizer of choice and hand the resulting
//! `(id, fingerprint)` pair to [`Aggregator::add_event`].
//!
//! ```no_run
//! use mysql_slowlog_stats::{Aggregator, LogParser, ParseOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let file = tokio::fs::File::open("mysql-slow.log").await?;
//! let mut parser = LogParser::new(file);
//! parser.start(ParseOptions::default()).await?;
//!
//! let mut aggregator = Aggregator::new(true, time::Duration::ZERO, 0.0);
//! let mut events = parser.events();
//! while let Some(event) = events.recv().await {
//!     let fingerprint = event.query.to_lowercase(); // your fingerprinter here
//!     let id = fingerprint.clone();
//!     aggregator.add_event(&event, &id, &fingerprint);
//! }
//! if let Some(err) = parser.error() {
//!     return Err(err.into());
//! }
//! let result = aggregator.finalize();
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::io::{self, SeekFrom};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{FutureExt, StreamExt};
use log::debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

mod aggregator;
mod class;
mod codec;
mod metrics;
mod parser;
mod types;

pub use crate::aggregator::{Aggregator, LogResult};
pub use crate::class::{Class, Example, MAX_EXAMPLE_BYTES};
pub use crate::codec::EventCodec;
pub use crate::metrics::{BoolStats, Metrics, NumberStats, TimeStats};
pub use crate::types::Event;

/// Terminal parser errors. No error travels through an individual event; an
/// event either emits or is discarded, and the error that stopped the stream
/// is retrievable afterwards from [`LogParser::error`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("parser is already started")]
    AlreadyStarted,
    #[error("read error: {0}")]
    Io(#[from] io::Error),
    #[error("crash: {0}")]
    Crash(String),
    #[error("no Query_time in event at {offset}")]
    MissingQueryTime { offset: u64 },
}

/// Options for a parser run.
#[derive(Clone, Debug, Default)]
pub struct ParseOptions {
    /// byte offset in the source at which to start parsing; emitted offsets
    /// stay in the source's coordinate system
    pub start_offset: u64,
    /// admin commands whose events are recognized and then suppressed
    pub filter_admin_command: HashSet<String>,
}

/// Parses events out of a slow log source in a background task.
///
/// The canonical source is a [`tokio::fs::File`], but anything readable and
/// seekable works. The parser never closes the source; closing stays with
/// the caller. Events arrive strictly in source order on the channel
/// returned by [`events`](Self::events), and the producer stays at most one
/// unconsumed event ahead of the consumer.
pub struct LogParser<R> {
    reader: Option<R>,
    tx: Option<mpsc::Sender<Event>>,
    rx: Option<mpsc::Receiver<Event>>,
    stop: CancellationToken,
    error: Arc<Mutex<Option<ParseError>>>,
    started: AtomicBool,
}

impl<R> LogParser<R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send + 'static,
{
    /// Wraps an open source positioned at offset zero.
    pub fn new(reader: R) -> Self {
        let (tx, rx) = mpsc::channel(1);

        Self {
            reader: Some(reader),
            tx: Some(tx),
            rx: Some(rx),
            stop: CancellationToken::new(),
            error: Arc::new(Mutex::new(None)),
            started: AtomicBool::new(false),
        }
    }

    /// Starts parsing. Parsing stops on EOF, terminal error, or a call to
    /// [`stop`](Self::stop); the event channel closes when parsing stops.
    /// Starting twice fails with [`ParseError::AlreadyStarted`].
    pub async fn start(&mut self, opt: ParseOptions) -> Result<(), ParseError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ParseError::AlreadyStarted);
        }

        let (Some(mut reader), Some(tx)) = (self.reader.take(), self.tx.take()) else {
            return Err(ParseError::AlreadyStarted);
        };

        if opt.start_offset > 0 {
            reader.seek(SeekFrom::Start(opt.start_offset)).await?;
        }

        let stop = self.stop.clone();
        let error = Arc::clone(&self.error);
        let codec = EventCodec::new(opt);

        tokio::spawn(async move {
            let parse = async {
                let mut events = FramedRead::new(reader, codec);

                loop {
                    let item = tokio::select! {
                        biased;
                        _ = stop.cancelled() => return Ok(()),
                        item = events.next() => item,
                    };

                    match item {
                        Some(Ok(event)) => {
                            // Emission is a bounded rendezvous: block until
                            // the consumer takes the event or stop fires.
                            tokio::select! {
                                biased;
                                _ = stop.cancelled() => return Ok(()),
                                res = tx.send(event) => {
                                    if res.is_err() {
                                        return Ok(());
                                    }
                                }
                            }
                        }
                        Some(Err(err)) => return Err(err),
                        None => return Ok(()),
                    }
                }
            };

            match AssertUnwindSafe(parse).catch_unwind().await {
                Ok(Ok(())) => debug!("parse done"),
                Ok(Err(err)) => {
                    *error.lock().unwrap() = Some(err);
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    *error.lock().unwrap() = Some(ParseError::Crash(msg));
                }
            }
        });

        Ok(())
    }

    /// Returns the receiving end of the event sequence. Events are not sent
    /// until [`start`](Self::start) is called, and the sequence has at most
    /// one consumer: a second call returns an already-closed channel.
    pub fn events(&mut self) -> mpsc::Receiver<Event> {
        self.rx.take().unwrap_or_else(|| mpsc::channel(1).1)
    }

    /// Stops the parser before the next event, or while it is blocked
    /// emitting the current one. Idempotent; a no-op before `start`.
    pub fn stop(&self) {
        if self.started.load(Ordering::SeqCst) {
            debug!("stopping");
            self.stop.cancel();
        }
    }

    /// Takes the error, if any, that terminated the event sequence.
    pub fn error(&self) -> Option<ParseError> {
        self.error.lock().unwrap().take()
    }
}
