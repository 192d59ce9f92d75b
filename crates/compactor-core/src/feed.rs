//! Event feed boundary: "object created" notifications for new fragments.
//!
//! Records arrive as JSON, one per line in the binary's feed. The object key
//! follows `<bucket>/<topics_dir>/<traces_topic>/_id=<activity>/<fragment>`.

use std::io::BufRead;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::ErrorCode;

/// One notification from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    #[serde(alias = "Key")]
    pub key: String,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub partition: Option<i32>,
    #[serde(default)]
    pub topic: Option<String>,
}

impl FeedRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            offset: None,
            partition: None,
            topic: None,
        }
    }
}

/// A fragment key decoded against the store layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentKey {
    pub activity_id: String,
    pub fragment_name: String,
    /// Object key inside the bucket (bucket name stripped).
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key `{0}` is not under the traces topic")]
    OutsideTopic(String),

    #[error("key `{0}` does not split into activity and fragment")]
    Shape(String),
}

impl KeyError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::MalformedEventKey
    }
}

impl FragmentKey {
    /// Decode `key`. A leading `<bucket>/` is optional.
    pub fn parse(key: &str, layout: &StoreConfig) -> Result<Self, KeyError> {
        let topic_prefix = layout.traces_prefix("");
        let topic_prefix = topic_prefix.trim_end_matches('/');
        let in_bucket = key
            .strip_prefix(layout.bucket.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| rest.starts_with(topic_prefix))
            .unwrap_or(key);

        let rest = in_bucket
            .strip_prefix(topic_prefix)
            .ok_or_else(|| KeyError::OutsideTopic(key.to_string()))?;

        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(activity_id), Some(fragment_name), None)
                if !activity_id.is_empty() && !fragment_name.is_empty() =>
            {
                Ok(Self {
                    activity_id: activity_id.to_string(),
                    fragment_name: fragment_name.to_string(),
                    path: in_bucket.to_string(),
                })
            }
            _ => Err(KeyError::Shape(key.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("feed record could not be decoded: {0}")]
    Decode(String),
}

impl FeedError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) => ErrorCode::StoreUnavailable,
            Self::Decode(_) => ErrorCode::MalformedFeedRecord,
        }
    }
}

/// A source of feed records. `Ok(None)` ends consumption.
pub trait EventFeed {
    fn next_record(&mut self) -> Result<Option<FeedRecord>, FeedError>;
}

/// Newline-delimited JSON records from any buffered reader.
///
/// Blank lines are ignored; lines that fail to decode are logged and skipped.
pub struct JsonLinesFeed<R> {
    reader: R,
    line: String,
    line_no: usize,
}

impl<R: BufRead> JsonLinesFeed<R> {
    pub const fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> EventFeed for JsonLinesFeed<R> {
    fn next_record(&mut self) -> Result<Option<FeedRecord>, FeedError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<FeedRecord>(trimmed) {
                Ok(record) => return Ok(Some(record)),
                Err(err) => {
                    warn!(
                        line = self.line_no,
                        error = %err,
                        code = ErrorCode::MalformedFeedRecord.code(),
                        "skipping malformed feed record"
                    );
                }
            }
        }
    }
}

impl<T: EventFeed + ?Sized> EventFeed for &mut T {
    fn next_record(&mut self) -> Result<Option<FeedRecord>, FeedError> {
        (**self).next_record()
    }
}
