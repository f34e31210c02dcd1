use std::io::Write as _;
use std::process::ExitCode;

use parley::{ChatSession, LogView, SendOutcome, SessionError, SettingsStore, TurnUpdate};
use parley_conversation::{Message, MessageStatus, Role};
use parley_transport::{TransportError, create_transport};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const QUIT_COMMAND: &str = "/quit";

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to create transport on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("chat session failed on `{stage}`: {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    Input {
        stage: &'static str,
        source: std::io::Error,
    },
}

enum Prompt {
    Line(std::io::Result<Option<String>>),
    Interrupt,
}

enum Step {
    Update(Result<Option<TurnUpdate>, SessionError>),
    Interrupt,
}

/// Forwards every Ctrl-C to the returned receiver.
///
/// Once `ctrl_c` has been awaited the default SIGINT handling is gone for the
/// whole process, so a single listener serves both the prompt and the turn.
fn listen_for_interrupts() -> mpsc::UnboundedReceiver<()> {
    let (interrupt_tx, interrupts) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %error, "failed to listen for ctrl-c");
                return;
            }
            if interrupt_tx.send(()).is_err() {
                return;
            }
        }
    });
    interrupts
}

/// Writes bot replies to stdout as they grow.
#[derive(Debug, Default)]
struct TranscriptPrinter {
    printed: usize,
    partial: usize,
}

impl TranscriptPrinter {
    fn render(&mut self, view: &LogView) {
        let messages = view.messages();
        let mut stdout = std::io::stdout().lock();

        for message in messages.iter().skip(self.printed) {
            if message.role == Role::User {
                self.printed += 1;
                continue;
            }

            match message.status {
                MessageStatus::Pending => {
                    self.write_suffix(&mut stdout, message);
                    break;
                }
                MessageStatus::Final => {
                    self.write_suffix(&mut stdout, message);
                    let _ = writeln!(stdout);
                    for citation in &message.citations {
                        let _ = writeln!(
                            stdout,
                            "  source: {} (chunk {})",
                            citation.source, citation.chunk_index
                        );
                    }
                }
                MessageStatus::Failed => {
                    if self.partial > 0 {
                        let _ = writeln!(stdout);
                    }
                    let _ = writeln!(stdout, "bot> [{}]", message.text);
                }
            }
            self.printed += 1;
            self.partial = 0;
        }

        let _ = stdout.flush();
    }

    fn write_suffix(&mut self, stdout: &mut impl std::io::Write, message: &Message) {
        let suffix = message.text.get(self.partial..).unwrap_or_default();
        if self.partial == 0 && !suffix.is_empty() {
            let _ = write!(stdout, "bot> ");
        }
        let _ = write!(stdout, "{suffix}");
        self.partial += suffix.len();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "parley exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), CliError> {
    let store = SettingsStore::load();
    let settings = store.settings();
    tracing::info!(
        config_path = ?store.config_path(),
        base_url = %settings.base_url,
        reply_mode = ?settings.reply_mode,
        "starting parley"
    );

    let transport = create_transport(settings.transport_config()).context(TransportSnafu {
        stage: "create-transport",
    })?;
    let mut session =
        ChatSession::new(transport, settings.session_config()).context(SessionSnafu {
            stage: "create-session",
        })?;
    let view = session.observe();
    let mut printer = TranscriptPrinter::default();
    printer.render(&view);

    let mut interrupts = listen_for_interrupts();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        let _ = std::io::stdout().flush();

        let prompt = tokio::select! {
            line = lines.next_line() => Prompt::Line(line),
            Some(()) = interrupts.recv() => Prompt::Interrupt,
        };
        let line = match prompt {
            Prompt::Line(line) => line.context(InputSnafu {
                stage: "read-line",
            })?,
            Prompt::Interrupt => {
                println!();
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim() == QUIT_COMMAND {
            break;
        }

        match session.send(&line).context(SessionSnafu { stage: "send" })? {
            SendOutcome::Ignored => continue,
            SendOutcome::Started(turn) => tracing::debug!(turn = %turn, "question sent"),
        }
        drive_turn(&mut session, &view, &mut printer, &mut interrupts).await?;
    }

    Ok(())
}

/// Renders the turn in flight until it settles; Ctrl-C cancels it.
async fn drive_turn(
    session: &mut ChatSession,
    view: &LogView,
    printer: &mut TranscriptPrinter,
    interrupts: &mut mpsc::UnboundedReceiver<()>,
) -> Result<(), CliError> {
    loop {
        let step = tokio::select! {
            update = session.next_update() => Step::Update(update),
            Some(()) = interrupts.recv() => Step::Interrupt,
        };

        match step {
            Step::Interrupt => {
                session.cancel().context(SessionSnafu {
                    stage: "cancel-turn",
                })?;
                printer.render(view);
                return Ok(());
            }
            Step::Update(update) => {
                let update = update.context(SessionSnafu {
                    stage: "next-update",
                })?;
                printer.render(view);
                match update {
                    None | Some(TurnUpdate::Settled(_)) => return Ok(()),
                    Some(TurnUpdate::Progress { .. }) => {}
                }
            }
        }
    }
}
