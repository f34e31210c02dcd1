use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use parley_conversation::{Citation, ConversationLog, Message, MessageId, PendingMutation};
use parley_transport::{
    ChatRequest, ChatTransport, FrameDecoder, ProtocolEvent, StreamFault, TransportConnection,
    TransportError, TransportSignal, TurnId,
};
use snafu::ResultExt;
use tokio::time::Instant;

use super::error::{LogSnafu, SessionError, SessionResult};
use super::events::{SendOutcome, TurnFailure, TurnOutcome, TurnResolution, TurnUpdate};
use super::turn::{TurnState, TurnTransition};
use super::view::{LogSnapshot, LogView};

pub const FAILURE_NOTICE: &str = "Sorry, something went wrong talking to the backend.";
pub const TIMEOUT_NOTICE: &str = "The backend took too long to respond.";
pub const CANCELLED_NOTICE: &str = "Request cancelled.";

pub const DEFAULT_FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum wait between `send` and the first body chunk.
    pub first_byte_timeout: Duration,
    /// Maximum wait between two chunks once data is flowing.
    pub idle_timeout: Option<Duration>,
    /// Bot message shown before the first turn.
    pub greeting: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            first_byte_timeout: DEFAULT_FIRST_BYTE_TIMEOUT,
            idle_timeout: None,
            greeting: None,
        }
    }
}

struct ActiveTurn {
    turn: TurnId,
    message_id: MessageId,
    connection: TransportConnection,
    decoder: Box<dyn FrameDecoder>,
    deadline: Option<Instant>,
    waited: Duration,
}

enum Input {
    Signal(Option<TransportSignal>),
    Timeout,
}

/// Owns the conversation log and drives one turn at a time.
///
/// All mutation happens on the task that calls [`Self::send`],
/// [`Self::cancel`] and [`Self::next_update`]; other tasks observe the log
/// through a [`LogView`]. `send` spawns the transport worker and therefore
/// must be called from within a tokio runtime.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    config: SessionConfig,
    log: ConversationLog,
    state: TurnState,
    active: Option<ActiveTurn>,
    next_turn: u64,
    revision: u64,
    published: Arc<ArcSwap<LogSnapshot>>,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn ChatTransport>, config: SessionConfig) -> SessionResult<Self> {
        let mut session = Self {
            transport,
            config,
            log: ConversationLog::new(),
            state: TurnState::Idle,
            active: None,
            next_turn: 1,
            revision: 0,
            published: Arc::new(ArcSwap::from_pointee(LogSnapshot::empty())),
        };

        if let Some(greeting) = session.config.greeting.as_deref().map(str::trim)
            && !greeting.is_empty()
        {
            session
                .log
                .append(Message::bot(greeting))
                .context(LogSnafu {
                    stage: "append-greeting",
                })?;
        }
        session.publish();

        Ok(session)
    }

    pub fn observe(&self) -> LogView {
        LogView::new(Arc::clone(&self.published))
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn turn_state(&self) -> TurnState {
        self.state
    }

    /// True while a turn is `Sending` or `Streaming`.
    pub fn is_pending(&self) -> bool {
        self.state.is_in_flight()
    }

    /// Starts a turn for `text`.
    ///
    /// Appends the user message and an empty pending bot message, then opens
    /// the transport. Blank input is ignored.
    pub fn send(&mut self, text: &str) -> SessionResult<SendOutcome> {
        let question = text.trim();
        if question.is_empty() {
            return Ok(SendOutcome::Ignored);
        }

        let turn = TurnId::new(self.next_turn);
        let next_state = match self.state.apply(TurnTransition::Send(turn)) {
            Ok(next_state) => next_state,
            Err(rejection) => {
                tracing::debug!(?rejection, "send rejected while a turn is in flight");
                return Err(SessionError::TurnInFlight {
                    stage: "send",
                    active: self.state.active_turn().unwrap_or(turn),
                });
            }
        };

        self.log.append(Message::user(question)).context(LogSnafu {
            stage: "append-user-message",
        })?;
        let placeholder = Message::bot_pending();
        let message_id = placeholder.id;
        if let Err(source) = self.log.append(placeholder) {
            tracing::error!(turn = %turn, error = %source, "failed to append bot placeholder");
            self.publish();
            return Err(SessionError::Log {
                stage: "append-bot-placeholder",
                source,
            });
        }

        self.next_turn += 1;
        self.state = next_state;

        let handle = self.transport.open(ChatRequest::new(turn, question));
        tokio::spawn(handle.worker);

        let waited = self.config.first_byte_timeout;
        self.active = Some(ActiveTurn {
            turn,
            message_id,
            connection: handle.connection,
            decoder: self.transport.reply_mode().decoder(),
            deadline: Some(Instant::now() + waited),
            waited,
        });

        tracing::debug!(
            turn = %turn,
            message_id = %message_id,
            transport = self.transport.id(),
            "turn started"
        );
        self.publish();
        Ok(SendOutcome::Started(turn))
    }

    /// Cancels the turn in flight.
    ///
    /// Returns `false` without touching the log when nothing is in flight.
    pub fn cancel(&mut self) -> SessionResult<bool> {
        let Some(mut active) = self.active.take() else {
            return Ok(false);
        };

        active.connection.cancel();
        self.finish(active, TurnResolution::Cancelled)?;
        Ok(true)
    }

    /// Waits for the next transport signal (or timeout) and folds it into the
    /// log.
    ///
    /// Returns `None` when no turn is in flight. This method is cancel safe.
    pub async fn next_update(&mut self) -> SessionResult<Option<TurnUpdate>> {
        let Some(active) = self.active.as_mut() else {
            return Ok(None);
        };

        let deadline = active.deadline;
        let input = tokio::select! {
            signal = active.connection.recv() => Input::Signal(signal),
            _ = sleep_until(deadline) => Input::Timeout,
        };

        let update = match input {
            Input::Signal(Some(TransportSignal::Data(chunk))) => self.on_data(chunk),
            Input::Signal(Some(TransportSignal::Complete)) => self.on_complete(),
            Input::Signal(Some(TransportSignal::Failed(error))) => {
                self.settle(TurnResolution::Failed(TurnFailure::Transport(error)))
            }
            Input::Signal(Some(TransportSignal::Cancelled)) => {
                self.settle(TurnResolution::Cancelled)
            }
            Input::Signal(None) => {
                let turn = self
                    .active
                    .as_ref()
                    .map_or(TurnId::new(0), |active| active.turn);
                self.settle(TurnResolution::Failed(TurnFailure::Transport(
                    TransportError::WorkerGone {
                        stage: "session-recv",
                        turn,
                    },
                )))
            }
            Input::Timeout => {
                let waited = self
                    .active
                    .as_ref()
                    .map(|active| active.waited)
                    .unwrap_or_default();
                self.settle(TurnResolution::Failed(TurnFailure::Transport(
                    TransportError::Timeout {
                        stage: "session-wait",
                        waited,
                    },
                )))
            }
        };

        if let Err(error) = &update {
            tracing::error!(error = %error, "failed to fold transport signal");
        }
        update
    }

    /// Drives the turn in flight until it settles.
    pub async fn run_turn(&mut self) -> SessionResult<Option<TurnOutcome>> {
        loop {
            match self.next_update().await? {
                None => return Ok(None),
                Some(TurnUpdate::Settled(outcome)) => return Ok(Some(outcome)),
                Some(TurnUpdate::Progress { .. }) => {}
            }
        }
    }

    fn on_data(&mut self, chunk: Bytes) -> SessionResult<Option<TurnUpdate>> {
        let Some(active) = self.active.as_mut() else {
            return Ok(None);
        };

        if let TurnState::Sending(turn) = self.state {
            match self.state.apply(TurnTransition::FirstData(turn)) {
                Ok(next_state) => {
                    tracing::debug!(turn = %turn, "first reply chunk received");
                    self.state = next_state;
                }
                Err(rejection) => {
                    tracing::error!(turn = %turn, ?rejection, "first data transition rejected");
                }
            }
        }

        active.deadline = self
            .config
            .idle_timeout
            .map(|idle_timeout| Instant::now() + idle_timeout);
        if let Some(idle_timeout) = self.config.idle_timeout {
            active.waited = idle_timeout;
        }

        let events = active.decoder.feed(&chunk);
        self.fold_events(events)
    }

    fn on_complete(&mut self) -> SessionResult<Option<TurnUpdate>> {
        let Some(active) = self.active.as_mut() else {
            return Ok(None);
        };

        let events = active.decoder.finish();
        match self.fold_events(events)? {
            Some(TurnUpdate::Settled(outcome)) => Ok(Some(TurnUpdate::Settled(outcome))),
            _ => self.settle(TurnResolution::Failed(TurnFailure::Stream(
                StreamFault::MissingDone { deltas: 0 },
            ))),
        }
    }

    fn fold_events(&mut self, events: Vec<ProtocolEvent>) -> SessionResult<Option<TurnUpdate>> {
        let Some(active) = self.active.as_ref() else {
            return Ok(None);
        };
        let (turn, message_id) = (active.turn, active.message_id);

        let mut deltas = 0;
        for event in events {
            match event {
                ProtocolEvent::Delta(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.log
                        .update_pending(message_id, PendingMutation::AppendText(text))
                        .context(LogSnafu {
                            stage: "append-delta",
                        })?;
                    deltas += 1;
                }
                ProtocolEvent::Done(sources) => {
                    let citations = sources
                        .into_iter()
                        .map(|source| Citation::new(source.source, source.chunk_index))
                        .collect();
                    self.log
                        .update_pending(message_id, PendingMutation::Finalize { citations })
                        .context(LogSnafu {
                            stage: "finalize-reply",
                        })?;
                    return self.settle(TurnResolution::Resolved);
                }
                ProtocolEvent::Error(fault) => {
                    return self.settle(TurnResolution::Failed(TurnFailure::Stream(fault)));
                }
            }
        }

        if deltas > 0 {
            self.publish();
        }
        Ok(Some(TurnUpdate::Progress {
            turn,
            message_id,
            deltas,
        }))
    }

    fn settle(&mut self, resolution: TurnResolution) -> SessionResult<Option<TurnUpdate>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        self.finish(active, resolution).map(Some)
    }

    /// Moves the pending message and the turn to their settled states.
    fn finish(
        &mut self,
        active: ActiveTurn,
        resolution: TurnResolution,
    ) -> SessionResult<TurnUpdate> {
        let ActiveTurn {
            turn,
            message_id,
            connection,
            ..
        } = active;
        connection.close();

        let transition = match &resolution {
            TurnResolution::Resolved => TurnTransition::Resolve(turn),
            TurnResolution::Failed(_) => TurnTransition::Fail(turn),
            TurnResolution::Cancelled => TurnTransition::Cancel(turn),
        };
        self.state = match self.state.apply(transition) {
            Ok(next_state) => next_state,
            Err(rejection) => {
                tracing::error!(turn = %turn, ?rejection, "settle transition rejected");
                TurnState::Failed(turn)
            }
        };

        let notice = match &resolution {
            TurnResolution::Resolved => None,
            TurnResolution::Failed(failure) if failure.is_timeout() => Some(TIMEOUT_NOTICE),
            TurnResolution::Failed(_) => Some(FAILURE_NOTICE),
            TurnResolution::Cancelled => Some(CANCELLED_NOTICE),
        };
        let result = match notice {
            Some(notice) => self
                .log
                .update_pending(
                    message_id,
                    PendingMutation::Fail {
                        notice: notice.to_string(),
                    },
                )
                .map(|_| ())
                .context(LogSnafu {
                    stage: "fail-pending-reply",
                }),
            None => Ok(()),
        };
        self.publish();

        if let Err(error) = &result {
            tracing::error!(
                turn = %turn,
                message_id = %message_id,
                error = %error,
                "failed to settle reply"
            );
        }
        result?;

        match &resolution {
            TurnResolution::Resolved => {
                tracing::debug!(turn = %turn, message_id = %message_id, "turn resolved");
            }
            TurnResolution::Failed(failure) => {
                tracing::warn!(
                    turn = %turn,
                    message_id = %message_id,
                    failure = ?failure,
                    "turn failed"
                );
            }
            TurnResolution::Cancelled => {
                tracing::debug!(turn = %turn, message_id = %message_id, "turn cancelled");
            }
        }

        Ok(TurnUpdate::Settled(TurnOutcome {
            turn,
            message_id,
            resolution,
        }))
    }

    fn publish(&mut self) {
        self.revision += 1;
        self.published.store(Arc::new(LogSnapshot {
            messages: self.log.snapshot(),
            turn_state: self.state,
            revision: self.revision,
        }));
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
