use parley_conversation::LogError;
use parley_transport::TurnId;
use snafu::Snafu;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("{active} is still in flight on `{stage}`"))]
    TurnInFlight { stage: &'static str, active: TurnId },
    #[snafu(display("conversation log rejected update on `{stage}`: {source}"))]
    Log {
        stage: &'static str,
        source: LogError,
    },
}
