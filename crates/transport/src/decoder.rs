use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;

use super::event::{ProtocolEvent, SourceRef, StreamFault};

/// Incremental reassembler from raw body chunks to [`ProtocolEvent`]s.
///
/// Implementations are stateful across chunks: chunk boundaries may fall
/// anywhere, including inside a frame or a UTF-8 code point, and the emitted
/// sequence must not depend on where they fall. After a terminal event the
/// decoder is halted and ignores further input.
pub trait FrameDecoder: Send {
    /// Consumes one chunk and returns every event completed by it.
    fn feed(&mut self, chunk: &[u8]) -> Vec<ProtocolEvent>;

    /// Signals end of stream and flushes what remains.
    fn finish(&mut self) -> Vec<ProtocolEvent>;

    fn is_halted(&self) -> bool;
}

impl<D: FrameDecoder + ?Sized> FrameDecoder for Box<D> {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ProtocolEvent> {
        (**self).feed(chunk)
    }

    fn finish(&mut self) -> Vec<ProtocolEvent> {
        (**self).finish()
    }

    fn is_halted(&self) -> bool {
        (**self).is_halted()
    }
}

/// Lazily decodes a chunk stream.
///
/// The returned stream ends after the first terminal event, or after the
/// events flushed by [`FrameDecoder::finish`] once `chunks` is exhausted.
pub fn decode_stream<D, S>(mut decoder: D, chunks: S) -> impl Stream<Item = ProtocolEvent> + Send
where
    D: FrameDecoder + 'static,
    S: Stream<Item = Bytes> + Send + 'static,
{
    async_stream::stream! {
        let mut chunks = std::pin::pin!(chunks);

        while let Some(chunk) = chunks.next().await {
            for event in decoder.feed(&chunk) {
                yield event;
            }
            if decoder.is_halted() {
                return;
            }
        }

        for event in decoder.finish() {
            yield event;
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonReply {
    answer: String,
    #[serde(default)]
    sources: Vec<SourceRef>,
}

/// Decoder for the one-shot `{ answer, sources }` reply.
///
/// The body is only meaningful as a whole, so every event is produced by
/// [`FrameDecoder::finish`].
#[derive(Debug, Default)]
pub struct JsonReplyDecoder {
    body: Vec<u8>,
    halted: bool,
}

impl JsonReplyDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for JsonReplyDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ProtocolEvent> {
        if !self.halted {
            self.body.extend_from_slice(chunk);
        }
        Vec::new()
    }

    fn finish(&mut self) -> Vec<ProtocolEvent> {
        if self.halted {
            return Vec::new();
        }
        self.halted = true;

        let body = std::mem::take(&mut self.body);
        if body.iter().all(u8::is_ascii_whitespace) {
            return vec![ProtocolEvent::Error(StreamFault::TruncatedStream {
                buffered_bytes: body.len(),
            })];
        }

        match serde_json::from_slice::<JsonReply>(&body) {
            Ok(reply) => {
                let mut events = Vec::with_capacity(2);
                if !reply.answer.is_empty() {
                    events.push(ProtocolEvent::Delta(reply.answer));
                }
                events.push(ProtocolEvent::Done(reply.sources));
                events
            }
            Err(error) if error.is_eof() => {
                vec![ProtocolEvent::Error(StreamFault::TruncatedStream {
                    buffered_bytes: body.len(),
                })]
            }
            Err(error) => vec![ProtocolEvent::Error(StreamFault::MalformedFrame {
                reason: format!("invalid reply body: {error}"),
            })],
        }
    }

    fn is_halted(&self) -> bool {
        self.halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_json(chunks: &[&str]) -> Vec<ProtocolEvent> {
        let mut decoder = JsonReplyDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.feed(chunk.as_bytes()));
        }
        events.extend(decoder.finish());
        events
    }

    #[test]
    fn answer_becomes_delta_then_done() {
        let events = decode_json(&[r#"{"answer":"Hel"#, r#"lo","sources":[]}"#]);

        assert_eq!(
            events,
            vec![
                ProtocolEvent::Delta("Hello".to_string()),
                ProtocolEvent::Done(Vec::new()),
            ]
        );
    }

    #[test]
    fn sources_accept_path_alias_and_missing_chunk_index() {
        let events = decode_json(&[
            r#"{"answer":"See policy","sources":[{"path":"remote.md","chunk_index":2},{"source":"vacation.md"}]}"#,
        ]);

        assert_eq!(
            events.last(),
            Some(&ProtocolEvent::Done(vec![
                SourceRef::new("remote.md", 2),
                SourceRef::new("vacation.md", -1),
            ]))
        );
    }

    #[test]
    fn cut_off_body_is_truncated() {
        let events = decode_json(&[r#"{"answer":"Hel"#]);

        assert!(matches!(
            events.as_slice(),
            [ProtocolEvent::Error(StreamFault::TruncatedStream { .. })]
        ));
    }

    #[test]
    fn empty_body_is_truncated() {
        assert_eq!(
            decode_json(&[]),
            vec![ProtocolEvent::Error(StreamFault::TruncatedStream {
                buffered_bytes: 0
            })]
        );
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let events = decode_json(&[r#"{"reply":"Hello"}"#]);

        assert!(matches!(
            events.as_slice(),
            [ProtocolEvent::Error(StreamFault::MalformedFrame { .. })]
        ));
    }

    #[test]
    fn finish_is_idempotent() {
        let mut decoder = JsonReplyDecoder::new();
        decoder.feed(br#"{"answer":"Hi"}"#);

        assert_eq!(decoder.finish().len(), 2);
        assert!(decoder.is_halted());
        assert!(decoder.finish().is_empty());
    }
}
