use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use super::connection::ConnectionHandle;
use super::decoder::{FrameDecoder, JsonReplyDecoder};
use super::event::TurnId;
use super::event_stream::EventStreamDecoder;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Which reply contract the backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplyMode {
    /// Incremental event-stream reply from `/chat-stream`.
    #[serde(rename = "stream")]
    EventStream,
    /// One-shot JSON reply from `/chat`.
    #[default]
    #[serde(rename = "json")]
    Json,
}

impl ReplyMode {
    pub fn endpoint_path(self) -> &'static str {
        match self {
            Self::EventStream => "/chat-stream",
            Self::Json => "/chat",
        }
    }

    /// Fresh decoder for one reply body.
    pub fn decoder(self) -> Box<dyn FrameDecoder> {
        match self {
            Self::EventStream => Box::new(EventStreamDecoder::new()),
            Self::Json => Box::new(JsonReplyDecoder::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub base_url: String,
    pub reply_mode: ReplyMode,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>, reply_mode: ReplyMode) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            reply_mode,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn endpoint_url(&self) -> String {
        format!("{}{}", self.base_url, self.reply_mode.endpoint_path())
    }
}

/// Payload of one outbound turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub turn: TurnId,
    pub question: String,
}

impl ChatRequest {
    pub fn new(turn: TurnId, question: impl Into<String>) -> Self {
        Self {
            turn,
            question: question.into(),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("no backend base URL configured"))]
    MissingBaseUrl { stage: &'static str },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status}: {body}"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read response body on `{stage}`: {source}"))]
    Body {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("no data received within {waited:?}"))]
    Timeout {
        stage: &'static str,
        waited: Duration,
    },
    #[snafu(display("transport worker for {turn} ended without a terminal signal"))]
    WorkerGone { stage: &'static str, turn: TurnId },
}

/// Opens one connection per turn.
///
/// Implementations never reconnect: a dropped channel is reported as
/// `Failed` and the caller decides what to do next.
pub trait ChatTransport: Send + Sync {
    fn id(&self) -> &str;
    fn reply_mode(&self) -> ReplyMode;
    fn open(&self, request: ChatRequest) -> ConnectionHandle;
}
