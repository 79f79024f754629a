//! Change feeds: ordered sources of change events.

use std::collections::VecDeque;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use graphsync_core::{ChangeEvent, FeedPosition};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Feed I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A lazy, ordered sequence of change events.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Next event, or `None` once the feed is exhausted.
    ///
    /// Must be cancel safe: the pipeline polls it inside `select!` and may
    /// drop the future before it completes.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, FeedError>;
}

/// Oplog entries as Extended JSON, one per line.
pub struct JsonLinesFeed<R> {
    lines: Lines<R>,
    resume_from: Option<FeedPosition>,
    line_no: u64,
    skipped: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            resume_from: None,
            line_no: 0,
            skipped: 0,
        }
    }

    /// Skip events older than `position`. The event at `position` itself is
    /// delivered again.
    pub fn resume_from(mut self, position: Option<FeedPosition>) -> Self {
        self.resume_from = position;
        self
    }

    /// Number of malformed lines skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> ChangeFeed for JsonLinesFeed<R> {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            match ChangeEvent::from_oplog_json(&line) {
                Ok(Some(event)) => {
                    if self.resume_from.is_some_and(|from| event.timestamp < from) {
                        continue;
                    }
                    return Ok(Some(event));
                }
                Ok(None) => {}
                Err(e) => {
                    self.skipped += 1;
                    tracing::warn!(line = self.line_no, error = %e, "Skipping malformed oplog entry");
                }
            }
        }
        Ok(None)
    }
}

/// A feed over events already in memory.
#[derive(Debug, Clone, Default)]
pub struct IterFeed {
    events: VecDeque<ChangeEvent>,
}

impl IterFeed {
    pub fn new(events: impl IntoIterator<Item = ChangeEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ChangeFeed for IterFeed {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, FeedError> {
        Ok(self.events.pop_front())
    }
}
