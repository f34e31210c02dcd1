#![deny(unsafe_code)]

//! Chat session layer: drives one turn at a time over a
//! [`parley_transport::ChatTransport`] and folds the reply into a
//! [`parley_conversation::ConversationLog`].

pub mod error;
pub mod events;
pub mod session;
pub mod settings;
pub mod turn;
pub mod view;

pub use error::{SessionError, SessionResult};
pub use events::{SendOutcome, TurnFailure, TurnOutcome, TurnResolution, TurnUpdate};
pub use session::{
    CANCELLED_NOTICE, ChatSession, DEFAULT_FIRST_BYTE_TIMEOUT, FAILURE_NOTICE, SessionConfig,
    TIMEOUT_NOTICE,
};
pub use settings::{DEFAULT_GREETING, Settings, SettingsError, SettingsStore};
pub use turn::{TurnState, TurnTransition, TurnTransitionRejection, TurnTransitionResult};
pub use view::{LogSnapshot, LogView};
