use futures::StreamExt;
use serde::Serialize;
use snafu::{ResultExt, ensure};

use super::connection::{CancelSignal, ConnectionFeed, ConnectionHandle, connection_channel};
use super::transport::{
    BuildClientSnafu, ChatRequest, ChatTransport, MissingBaseUrlSnafu, ReplyMode, TransportConfig,
    TransportError, TransportResult,
};

pub const HTTP_TRANSPORT_ID: &str = "http";

#[derive(Debug, Serialize)]
struct QuestionBody {
    question: String,
}

/// [`ChatTransport`] over plain HTTP `POST`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: TransportConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        ensure!(
            !config.base_url.is_empty(),
            MissingBaseUrlSnafu {
                stage: "http-transport-new",
            }
        );

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self { config, client })
    }

    async fn run_worker(
        client: reqwest::Client,
        url: String,
        request: ChatRequest,
        feed: ConnectionFeed,
        mut cancel: CancelSignal,
    ) {
        let turn = request.turn;
        let send = client
            .post(url.as_str())
            .json(&QuestionBody {
                question: request.question,
            })
            .send();

        let response = tokio::select! {
            _ = cancel.fired() => {
                tracing::debug!(turn = %turn, "request cancelled before response");
                feed.cancelled();
                return;
            }
            result = send => result,
        };

        let response = match response {
            Ok(response) => response,
            Err(source) => {
                tracing::warn!(turn = %turn, url = %url, error = %source, "chat request failed");
                feed.fail(TransportError::Request {
                    stage: "send-request",
                    url,
                    source,
                });
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                _ = cancel.fired() => {
                    feed.cancelled();
                    return;
                }
                body = response.text() => body.unwrap_or_default(),
            };
            tracing::warn!(
                turn = %turn,
                status = status.as_u16(),
                "backend rejected chat request"
            );
            feed.fail(TransportError::HttpStatus {
                stage: "response-status",
                status: status.as_u16(),
                body,
            });
            return;
        }

        let mut body = response.bytes_stream();
        let mut received = 0usize;

        loop {
            tokio::select! {
                _ = cancel.fired() => {
                    tracing::debug!(turn = %turn, received, "response stream cancelled");
                    feed.cancelled();
                    return;
                }
                next_chunk = body.next() => {
                    match next_chunk {
                        Some(Ok(chunk)) => {
                            if chunk.is_empty() {
                                continue;
                            }
                            received += chunk.len();
                            if !feed.data(chunk) {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                turn = %turn,
                                received,
                                error = %source,
                                "response body failed mid-stream"
                            );
                            feed.fail(TransportError::Body {
                                stage: "read-body",
                                source,
                            });
                            return;
                        }
                        None => {
                            tracing::debug!(turn = %turn, received, "response body complete");
                            feed.complete();
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl ChatTransport for HttpTransport {
    fn id(&self) -> &str {
        HTTP_TRANSPORT_ID
    }

    fn reply_mode(&self) -> ReplyMode {
        self.config.reply_mode
    }

    fn open(&self, request: ChatRequest) -> ConnectionHandle {
        let (feed, cancel, connection) = connection_channel(request.turn);
        let url = self.config.endpoint_url();
        tracing::debug!(turn = %request.turn, url = %url, "opening chat connection");

        let worker = Box::pin(Self::run_worker(
            self.client.clone(),
            url,
            request,
            feed,
            cancel,
        ));

        ConnectionHandle { connection, worker }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_follows_reply_mode() {
        let stream = TransportConfig::new("http://localhost:8000/", ReplyMode::EventStream);
        let json = TransportConfig::new(" http://localhost:8000 ", ReplyMode::Json);

        assert_eq!(stream.endpoint_url(), "http://localhost:8000/chat-stream");
        assert_eq!(json.endpoint_url(), "http://localhost:8000/chat");
    }

    #[test]
    fn blank_base_url_is_rejected() {
        let error = HttpTransport::new(TransportConfig::new("   ", ReplyMode::Json))
            .expect_err("blank base url must fail");

        assert!(matches!(error, TransportError::MissingBaseUrl { .. }));
    }
}
