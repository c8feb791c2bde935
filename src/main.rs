use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use livepoll::config::{ConfigError, SessionConfig};
use livepoll::error::ErrorCode;
use livepoll::ledger::{AnswerLedger, LedgerError};
use livepoll::net::api::{ApiError, HttpSessionApi};
use livepoll::net::channel::{ChannelConfig, spawn_push_channel};
use livepoll::resume::ResumeMarker;
use livepoll::session::{RoomSession, SessionContext, SessionError, SessionHandle};
use livepoll::storage::{FileStore, KeyValueStore, StorageError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no room to resume; join one with `livepoll join <CODE>`")]
    NothingToResume,
    #[error("stdin read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "livepoll", about = "Join a live poll room and answer polls from the terminal")]
struct Cli {
    /// Identity forwarded with each answer.
    #[arg(long, env = "LIVEPOLL_USER_ID")]
    user_id: Option<String>,

    #[arg(long, env = "LIVEPOLL_STORE_PATH")]
    store_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room and answer its polls interactively.
    Join { room_code: String },
    /// Rejoin the room left open by the last run.
    Resume,
    /// Print the answers recorded for a room.
    History { room_code: String },
    /// Drop the answers recorded for a room.
    Forget { room_code: String },
}

/// One line typed by the user while joined.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Select { poll_id: String, option_index: usize },
    Submit { poll_id: String, option_index: Option<usize> },
    Polls,
    Leave,
    Help,
}

const HELP: &str = "commands: select <poll> <n> | submit <poll> [n] | polls | leave";

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SessionConfig::from_env()?;
    if cli.user_id.is_some() {
        config.user_id = cli.user_id;
    }
    if let Some(path) = cli.store_path {
        config.store_path = path;
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(config.store_path.clone())?);
    let ledger = AnswerLedger::new(store.clone());
    let resume = ResumeMarker::new(store);

    match cli.command {
        Command::Join { room_code } => run_session(config, ledger, resume, &room_code).await,
        Command::Resume => {
            let room_code = resume.load()?.ok_or(CliError::NothingToResume)?;
            tracing::info!(%room_code, "resuming room");
            run_session(config, ledger, resume, &room_code).await
        }
        Command::History { room_code } => {
            let answers = ledger.load(&room_code)?;
            println!("{}", serde_json::to_string_pretty(&answers)?);
            Ok(())
        }
        Command::Forget { room_code } => {
            ledger.forget(&room_code)?;
            println!("forgot answers for room {room_code}");
            Ok(())
        }
    }
}

async fn run_session(
    config: SessionConfig,
    ledger: AnswerLedger,
    resume: ResumeMarker,
    room_code: &str,
) -> Result<(), CliError> {
    let api = Arc::new(HttpSessionApi::new(&config.api_url, config.timeouts)?);
    let channel = spawn_push_channel(ChannelConfig { url: config.ws_url.clone(), reconnect: config.reconnect });
    let session = RoomSession::new(SessionContext { channel, api, ledger, resume, config }).spawn();
    let mut notices = session.notices();

    let snapshot = session.join(room_code).await?;
    println!("{}", serde_json::to_string(&snapshot)?);
    eprintln!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_input(&line) {
                    Ok(Input::Leave) => break,
                    Ok(input) => dispatch(&session, input).await?,
                    Err(message) => eprintln!("{message}"),
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => println!("{}", serde_json::to_string(&notice)?),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notices dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            // Interrupt keeps the resume marker, like closing a tab.
            _ = tokio::signal::ctrl_c() => {
                session.detach().await?;
                return Ok(());
            }
        }
    }

    session.leave().await?;
    Ok(())
}

async fn dispatch(session: &SessionHandle, input: Input) -> Result<(), CliError> {
    let result = match input {
        Input::Select { poll_id, option_index } => session.select(&poll_id, option_index).await,
        Input::Submit { poll_id, option_index: Some(index) } => session.submit(&poll_id, index).await,
        Input::Submit { poll_id, option_index: None } => session.submit_selected(&poll_id).await,
        Input::Polls => {
            println!("{}", serde_json::to_string(&session.snapshot())?);
            Ok(())
        }
        Input::Help | Input::Leave => {
            eprintln!("{HELP}");
            Ok(())
        }
    };

    match result {
        Err(SessionError::Stopped) => Err(SessionError::Stopped.into()),
        Err(e) => {
            eprintln!("error [{}]: {e}", e.error_code());
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

fn parse_input(line: &str) -> Result<Input, String> {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let poll_id = words.next().map(ToOwned::to_owned);
    let index = words
        .next()
        .map(|raw| raw.parse::<usize>().map_err(|_| format!("not an option number: {raw}")))
        .transpose()?;

    match (command, poll_id, index) {
        ("select", Some(poll_id), Some(option_index)) => Ok(Input::Select { poll_id, option_index }),
        ("submit", Some(poll_id), option_index) => Ok(Input::Submit { poll_id, option_index }),
        ("polls", None, None) => Ok(Input::Polls),
        ("leave" | "quit", None, None) => Ok(Input::Leave),
        ("help", _, _) => Ok(Input::Help),
        _ => Err(HELP.to_owned()),
    }
}
