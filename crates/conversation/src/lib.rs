pub mod error;
pub mod ids;
pub mod log;
pub mod types;

pub use error::{LogError, LogResult};
pub use ids::MessageId;
pub use log::ConversationLog;
pub use types::{Citation, Message, MessageStatus, PendingMutation, Role};
