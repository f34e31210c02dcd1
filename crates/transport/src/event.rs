use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Identifier for one user turn; every connection belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "turn-{}", self.0)
    }
}

/// Citation record as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Older backends name this field `path`.
    #[serde(alias = "path")]
    pub source: String,
    #[serde(default = "unknown_chunk_index")]
    pub chunk_index: i64,
}

impl SourceRef {
    pub fn new(source: impl Into<String>, chunk_index: i64) -> Self {
        Self {
            source: source.into(),
            chunk_index,
        }
    }
}

fn unknown_chunk_index() -> i64 {
    -1
}

/// Reason a decoder produced an [`ProtocolEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum StreamFault {
    #[snafu(display("malformed frame: {reason}"))]
    MalformedFrame { reason: String },
    #[snafu(display("stream ended with {buffered_bytes} bytes of an incomplete frame"))]
    TruncatedStream { buffered_bytes: usize },
    #[snafu(display("stream ended after {deltas} deltas without a done frame"))]
    MissingDone { deltas: usize },
    #[snafu(display("backend reported an error: {message}"))]
    Remote { message: String },
}

/// One decoded frame of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Delta(String),
    Done(Vec<SourceRef>),
    Error(StreamFault),
}

impl ProtocolEvent {
    /// `Done` and `Error` end the reply; nothing is decoded after them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}
