//! Decoder for event-stream replies.
//!
//! Frames are separated by a blank line and consist of `field: value` lines:
//!
//! ```text
//! data: He
//!
//! event: delta
//! data: llo
//!
//! event: done
//! data: {"sources":[{"source":"vacation.md","chunk_index":3}]}
//!
//! ```
//!
//! `event` defaults to `delta`. Multiple `data` lines are joined with `\n`,
//! lines starting with `:` are comments, and `id`/`retry` are ignored.

use serde::Deserialize;

use super::decoder::FrameDecoder;
use super::event::{ProtocolEvent, SourceRef, StreamFault};

#[derive(Debug, Default, Deserialize)]
struct DonePayload {
    #[serde(default)]
    sources: Vec<SourceRef>,
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    /// Buffer offset where the next delimiter search starts.
    scanned: usize,
    deltas: usize,
    halted: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn halt_with(&mut self, fault: StreamFault) -> ProtocolEvent {
        self.halted = true;
        self.buffer.clear();
        ProtocolEvent::Error(fault)
    }

    fn malformed(&mut self, reason: String) -> ProtocolEvent {
        tracing::debug!(reason = %reason, "rejecting malformed event-stream frame");
        self.halt_with(StreamFault::MalformedFrame { reason })
    }

    fn decode_frame(&mut self, frame: &[u8]) -> Option<ProtocolEvent> {
        let text = match std::str::from_utf8(frame) {
            Ok(text) => text,
            Err(error) => return Some(self.malformed(format!("frame is not valid UTF-8: {error}"))),
        };

        let mut event_name = None;
        let mut data: Option<String> = None;

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => event_name = Some(value),
                "data" => match data.as_mut() {
                    Some(buffer) => {
                        buffer.push('\n');
                        buffer.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                },
                "id" | "retry" => {}
                other => return Some(self.malformed(format!("unknown field `{other}`"))),
            }
        }

        if event_name.is_none() && data.is_none() {
            // Comment-only frames are keep-alives.
            return None;
        }

        match event_name.unwrap_or("delta") {
            "delta" | "message" => {
                let fragment = data.unwrap_or_default();
                if fragment.is_empty() {
                    return None;
                }
                self.deltas += 1;
                Some(ProtocolEvent::Delta(fragment))
            }
            "done" => {
                let payload = match data.as_deref().map(str::trim) {
                    None | Some("") => DonePayload::default(),
                    Some(raw) => match serde_json::from_str::<DonePayload>(raw) {
                        Ok(payload) => payload,
                        Err(error) => {
                            return Some(self.malformed(format!("invalid done payload: {error}")));
                        }
                    },
                };
                self.halted = true;
                self.buffer.clear();
                Some(ProtocolEvent::Done(payload.sources))
            }
            "error" => {
                let message = data
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| "unspecified backend error".to_string());
                Some(self.halt_with(StreamFault::Remote { message }))
            }
            other => Some(self.malformed(format!("unknown event `{other}`"))),
        }
    }
}

impl FrameDecoder for EventStreamDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ProtocolEvent> {
        if self.halted {
            return Vec::new();
        }

        self.buffer.extend_from_slice(chunk);

        let mut buffer = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some((frame_len, delimiter_len)) =
            find_frame_end(&buffer[consumed..], self.scanned)
        {
            let frame = &buffer[consumed..consumed + frame_len];
            consumed += frame_len + delimiter_len;
            self.scanned = 0;

            if let Some(event) = self.decode_frame(frame) {
                events.push(event);
            }
            if self.halted {
                return events;
            }
        }

        buffer.drain(..consumed);
        // A newline in the last two bytes may still open a delimiter.
        self.scanned = buffer.len().saturating_sub(2);
        self.buffer = buffer;
        events
    }

    fn finish(&mut self) -> Vec<ProtocolEvent> {
        if self.halted {
            return Vec::new();
        }

        let buffered_bytes = self.buffer.len();
        let fault = if self.buffer.iter().all(u8::is_ascii_whitespace) {
            StreamFault::MissingDone {
                deltas: self.deltas,
            }
        } else {
            StreamFault::TruncatedStream { buffered_bytes }
        };
        vec![self.halt_with(fault)]
    }

    fn is_halted(&self) -> bool {
        self.halted
    }
}

/// Locates the first blank-line delimiter, returning the frame length and the
/// delimiter length. Accepts `\n\n` and `\n\r\n` (the tail of `\r\n\r\n`).
/// Bytes before `from` are known not to start a delimiter.
fn find_frame_end(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    buffer
        .iter()
        .enumerate()
        .skip(from)
        .filter(|(_, byte)| **byte == b'\n')
        .find_map(|(index, _)| match &buffer[index + 1..] {
            [b'\n', ..] => Some((index, 2)),
            [b'\r', b'\n', ..] => Some((index, 3)),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::StreamExt;
    use proptest::prelude::*;

    use super::*;
    use crate::decoder::decode_stream;

    fn decode_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Vec<ProtocolEvent> {
        let mut decoder = EventStreamDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.feed(chunk));
        }
        events.extend(decoder.finish());
        events
    }

    fn decode_whole(body: &str) -> Vec<ProtocolEvent> {
        decode_chunks([body.as_bytes()])
    }

    fn delta(text: &str) -> ProtocolEvent {
        ProtocolEvent::Delta(text.to_string())
    }

    #[test]
    fn deltas_then_done_with_sources() {
        let body = concat!(
            "data: He\n\n",
            "event: delta\ndata: llo\n\n",
            "event: done\n",
            "data: {\"sources\":[{\"source\":\"vacation.md\",\"chunk_index\":3}]}\n\n",
        );

        assert_eq!(
            decode_whole(body),
            vec![
                delta("He"),
                delta("llo"),
                ProtocolEvent::Done(vec![SourceRef::new("vacation.md", 3)]),
            ]
        );
    }

    #[test]
    fn crlf_delimiters_and_comments_are_accepted() {
        let body = ": keep-alive\r\n\r\ndata: Hi\r\nid: 7\r\n\r\nevent: done\r\n\r\n";

        assert_eq!(
            decode_whole(body),
            vec![delta("Hi"), ProtocolEvent::Done(Vec::new())]
        );
    }

    #[test]
    fn multiple_data_lines_are_joined_with_newlines() {
        let body = "data: first line\ndata: second line\n\nevent: done\n\n";

        assert_eq!(
            decode_whole(body),
            vec![delta("first line\nsecond line"), ProtocolEvent::Done(Vec::new())]
        );
    }

    #[test]
    fn only_one_leading_space_is_stripped() {
        let body = "data:  world\n\nevent: done\n\n";

        assert_eq!(decode_whole(body)[0], delta(" world"));
    }

    #[test]
    fn delimiter_search_resumes_near_the_buffer_tail() {
        let mut decoder = EventStreamDecoder::new();

        assert!(decoder.feed(b"data: a long frame").is_empty());
        assert_eq!(decoder.scanned, "data: a long frame".len() - 2);
        assert!(decoder.feed(b" body\r\n").is_empty());
        assert!(decoder.feed(b"\r").is_empty());
        assert_eq!(decoder.scanned, "data: a long frame body\r\n\r".len() - 2);

        assert_eq!(decoder.feed(b"\n"), vec![delta("a long frame body")]);
        assert_eq!(decoder.scanned, 0);
        assert!(decoder.buffer.is_empty());
    }

    #[test]
    fn chunk_boundary_inside_frame_is_buffered() {
        let mut decoder = EventStreamDecoder::new();

        assert!(decoder.feed(b"data: He").is_empty());
        assert!(decoder.feed(b"llo\n").is_empty());
        assert_eq!(decoder.feed(b"\n"), vec![delta("Hello")]);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let body = "data: caf\u{e9} \u{65e5}\u{672c}\n\nevent: done\n\n".as_bytes();
        let split = body
            .iter()
            .position(|byte| *byte == 0xc3)
            .expect("body contains a two-byte code point")
            + 1;

        let events = decode_chunks([&body[..split], &body[split..]]);

        assert_eq!(events[0], delta("caf\u{e9} \u{65e5}\u{672c}"));
    }

    #[test]
    fn remainder_at_end_of_stream_is_truncation() {
        let events = decode_whole("data: Hello\n\ndata: wor");

        assert_eq!(
            events,
            vec![
                delta("Hello"),
                ProtocolEvent::Error(StreamFault::TruncatedStream { buffered_bytes: 9 }),
            ]
        );
    }

    #[test]
    fn clean_end_without_done_is_reported() {
        let events = decode_whole("data: Hello\n\n");

        assert_eq!(
            events,
            vec![
                delta("Hello"),
                ProtocolEvent::Error(StreamFault::MissingDone { deltas: 1 }),
            ]
        );
    }

    #[test]
    fn malformed_frame_halts_decoding() {
        let mut decoder = EventStreamDecoder::new();

        let events = decoder.feed(b"data: ok\n\nbogus line\n\ndata: never\n\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], delta("ok"));
        assert!(matches!(
            events[1],
            ProtocolEvent::Error(StreamFault::MalformedFrame { .. })
        ));
        assert!(decoder.is_halted());
        assert!(decoder.feed(b"data: later\n\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn unknown_event_and_bad_done_payload_are_malformed() {
        for body in [
            "event: surprise\ndata: x\n\n",
            "event: done\ndata: {not json\n\n",
        ] {
            assert!(
                matches!(
                    decode_whole(body).as_slice(),
                    [ProtocolEvent::Error(StreamFault::MalformedFrame { .. })]
                ),
                "expected malformed frame for {body:?}"
            );
        }
    }

    #[test]
    fn error_frame_surfaces_remote_message() {
        let events = decode_whole("data: Hi\n\nevent: error\ndata: model offline\n\n");

        assert_eq!(
            events,
            vec![
                delta("Hi"),
                ProtocolEvent::Error(StreamFault::Remote {
                    message: "model offline".to_string()
                }),
            ]
        );
    }

    #[test]
    fn input_after_done_is_ignored() {
        let events = decode_whole("event: done\n\ndata: trailing\n\n");

        assert_eq!(events, vec![ProtocolEvent::Done(Vec::new())]);
    }

    #[tokio::test]
    async fn decode_stream_yields_events_lazily() {
        let chunks = futures::stream::iter(
            ["data: He", "llo\n\nevent: do", "ne\n\n", "data: ignored\n\n"]
                .into_iter()
                .map(|s| Bytes::from_static(s.as_bytes())),
        );

        let events = decode_stream(EventStreamDecoder::new(), chunks)
            .collect::<Vec<_>>()
            .await;

        assert_eq!(events, vec![delta("Hello"), ProtocolEvent::Done(Vec::new())]);
    }

    #[tokio::test]
    async fn decode_stream_flushes_truncation_at_end() {
        let chunks = futures::stream::iter([Bytes::from_static(b"data: partial")]);

        let events = decode_stream(EventStreamDecoder::new(), chunks)
            .collect::<Vec<_>>()
            .await;

        assert_eq!(
            events,
            vec![ProtocolEvent::Error(StreamFault::TruncatedStream {
                buffered_bytes: 13
            })]
        );
    }

    fn render_body(fragments: &[String], terminate: bool) -> String {
        let mut body = String::from(": stream open\n\n");
        for fragment in fragments {
            for line in fragment.split('\n') {
                body.push_str("data: ");
                body.push_str(line);
                body.push('\n');
            }
            body.push('\n');
        }
        if terminate {
            body.push_str("event: done\r\ndata: {\"sources\":[{\"path\":\"a.md\",\"chunk_index\":1}]}\r\n\r\n");
        }
        body
    }

    fn split_at_points(body: &[u8], mut points: Vec<usize>) -> Vec<&[u8]> {
        points.iter_mut().for_each(|point| *point %= body.len() + 1);
        points.sort_unstable();

        let mut chunks = Vec::with_capacity(points.len() + 1);
        let mut start = 0;
        for point in points {
            chunks.push(&body[start..point]);
            start = point;
        }
        chunks.push(&body[start..]);
        chunks
    }

    proptest! {
        #[test]
        fn chunk_boundaries_do_not_change_events(
            fragments in prop::collection::vec("[a-z \u{e9}\u{65e5}\n:]{1,12}", 0..6),
            terminate in any::<bool>(),
            truncate_by in 0usize..4,
            points in prop::collection::vec(any::<usize>(), 0..12),
        ) {
            let rendered = render_body(&fragments, terminate);
            let body = &rendered.as_bytes()[..rendered.len() - truncate_by.min(rendered.len())];

            let whole = decode_chunks([body]);
            let chunked = decode_chunks(split_at_points(body, points));

            prop_assert_eq!(&whole, &chunked);
            prop_assert!(whole.last().is_some_and(ProtocolEvent::is_terminal));
        }
    }
}
