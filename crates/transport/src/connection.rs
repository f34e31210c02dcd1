use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::event::TurnId;
use super::transport::TransportError;

pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Lifecycle signal delivered by a [`TransportConnection`].
///
/// Zero or more `Data` signals are followed by exactly one terminal signal.
#[derive(Debug)]
pub enum TransportSignal {
    Data(Bytes),
    Complete,
    Failed(TransportError),
    Cancelled,
}

impl TransportSignal {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Opened, nothing received yet.
    Open,
    Receiving,
    Completed,
    Failed,
    Cancelled,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Consumer half of one turn's channel.
///
/// Dropping the connection releases the channel and tells the worker to stop.
#[derive(Debug)]
pub struct TransportConnection {
    turn: TurnId,
    state: ConnectionState,
    signals: mpsc::UnboundedReceiver<TransportSignal>,
    cancel_tx: Option<oneshot::Sender<()>>,
    deliver_cancelled: bool,
}

impl TransportConnection {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Waits for the next signal.
    ///
    /// Returns `None` once the terminal signal has been delivered. A worker
    /// that goes away without sending a terminal signal is reported as
    /// [`TransportError::WorkerGone`]. This method is cancel safe.
    pub async fn recv(&mut self) -> Option<TransportSignal> {
        if self.state.is_terminal() {
            return std::mem::take(&mut self.deliver_cancelled)
                .then_some(TransportSignal::Cancelled);
        }

        let signal = match self.signals.recv().await {
            Some(signal) => signal,
            None => TransportSignal::Failed(TransportError::WorkerGone {
                stage: "connection-recv",
                turn: self.turn,
            }),
        };

        self.state = match &signal {
            TransportSignal::Data(_) => ConnectionState::Receiving,
            TransportSignal::Complete => ConnectionState::Completed,
            TransportSignal::Failed(_) => ConnectionState::Failed,
            TransportSignal::Cancelled => ConnectionState::Cancelled,
        };
        if self.state.is_terminal() {
            self.release();
        }

        Some(signal)
    }

    /// Forces the connection into `Cancelled`.
    ///
    /// Returns `false` without side effects when a terminal signal was already
    /// delivered. Signals buffered before the call are discarded, so no `Data`
    /// is observed afterwards; the next [`Self::recv`] yields `Cancelled`.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        tracing::debug!(turn = %self.turn, "cancelling transport connection");
        self.state = ConnectionState::Cancelled;
        self.deliver_cancelled = true;
        self.release();
        true
    }

    /// Releases the channel after the reply was fully consumed.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        self.signals.close();
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.release();
    }
}

/// Producer half of one turn's channel, owned by the transport worker.
///
/// Terminal methods consume the feed, so at most one terminal signal can be
/// sent; dropping the feed without one surfaces as `WorkerGone`.
#[derive(Debug)]
pub struct ConnectionFeed {
    signals: mpsc::UnboundedSender<TransportSignal>,
}

impl ConnectionFeed {
    /// Forwards one body chunk. Returns `false` once the consumer is gone.
    pub fn data(&self, chunk: Bytes) -> bool {
        self.signals.send(TransportSignal::Data(chunk)).is_ok()
    }

    pub fn complete(self) {
        let _ = self.signals.send(TransportSignal::Complete);
    }

    pub fn fail(self, error: TransportError) {
        let _ = self.signals.send(TransportSignal::Failed(error));
    }

    /// Acknowledges a cancellation observed through [`CancelSignal`].
    pub fn cancelled(self) {
        let _ = self.signals.send(TransportSignal::Cancelled);
    }

    pub fn is_closed(&self) -> bool {
        self.signals.is_closed()
    }
}

/// Cancellation token handed to the transport worker.
///
/// Fires when the consumer cancels, closes, or drops its connection.
#[derive(Debug)]
pub struct CancelSignal {
    cancel_rx: oneshot::Receiver<()>,
}

impl CancelSignal {
    /// Resolves once cancellation was requested. Must not be awaited again
    /// after it resolved.
    pub async fn fired(&mut self) {
        let _ = (&mut self.cancel_rx).await;
    }

    pub fn is_fired(&mut self) -> bool {
        !matches!(
            self.cancel_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        )
    }
}

/// Result of [`crate::ChatTransport::open`].
///
/// The caller spawns `worker`; establishing the channel happens there so
/// opening never blocks.
pub struct ConnectionHandle {
    pub connection: TransportConnection,
    pub worker: TransportWorker,
}

/// Creates the three halves of one turn's channel.
pub fn connection_channel(turn: TurnId) -> (ConnectionFeed, CancelSignal, TransportConnection) {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        ConnectionFeed { signals: signal_tx },
        CancelSignal { cancel_rx },
        TransportConnection {
            turn,
            state: ConnectionState::Open,
            signals: signal_rx,
            cancel_tx: Some(cancel_tx),
            deliver_cancelled: false,
        },
    )
}
