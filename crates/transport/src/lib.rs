pub mod connection;
pub mod decoder;
pub mod event;
pub mod event_stream;
pub mod http;
pub mod transport;

use std::sync::Arc;

pub use connection::{
    CancelSignal, ConnectionFeed, ConnectionHandle, ConnectionState, TransportConnection,
    TransportSignal, TransportWorker, connection_channel,
};
pub use decoder::{FrameDecoder, JsonReplyDecoder, decode_stream};
pub use event::{ProtocolEvent, SourceRef, StreamFault, TurnId};
pub use event_stream::EventStreamDecoder;
pub use http::{HTTP_TRANSPORT_ID, HttpTransport};
pub use transport::{
    ChatRequest, ChatTransport, DEFAULT_CONNECT_TIMEOUT, ReplyMode, TransportConfig,
    TransportError, TransportResult,
};

/// Builds the HTTP transport for `config`.
pub fn create_transport(config: TransportConfig) -> TransportResult<Arc<dyn ChatTransport>> {
    Ok(Arc::new(HttpTransport::new(config)?))
}
