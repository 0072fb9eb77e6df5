#![forbid(unsafe_code)]

//! `agent-session-ctl`: operator CLI for the session runtime database.
//!
//! Works directly against the `SQLite` store. Decisions submitted here are
//! recorded durably and applied by the next execution of the session.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agent_session_runtime::config::GlobalConfig;
use agent_session_runtime::models::approval::Decision;
use agent_session_runtime::models::event::reconstruct;
use agent_session_runtime::models::session::SessionStatus;
use agent_session_runtime::orchestrator::approval_gate::ApprovalGate;
use agent_session_runtime::persistence::approval_repo::ApprovalRepo;
use agent_session_runtime::persistence::db::{self, Database};
use agent_session_runtime::persistence::event_repo::EventRepo;
use agent_session_runtime::persistence::retention;
use agent_session_runtime::persistence::session_repo::SessionRepo;
use agent_session_runtime::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum StatusFilter {
    Active,
    WaitingApproval,
    Completed,
    Error,
}

impl From<StatusFilter> for SessionStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Active => Self::Active,
            StatusFilter::WaitingApproval => Self::WaitingApproval,
            StatusFilter::Completed => Self::Completed,
            StatusFilter::Error => Self::Error,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "agent-session-ctl",
    about = "Operator CLI for the agent session runtime",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List sessions, newest first.
    Sessions {
        /// Only list sessions in this status.
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },

    /// Show one session with its messages and approval requests.
    Show {
        /// Session ID.
        id: String,
    },

    /// Print the stored event log of a session.
    Events {
        /// Session ID.
        id: String,
        /// First sequence number to print.
        #[arg(long, default_value_t = 0)]
        from: u64,
    },

    /// Check that replaying the event log reproduces the stored session state.
    Verify {
        /// Session ID.
        id: String,
    },

    /// Approve the pending tool call of a session.
    Approve {
        /// Session ID.
        id: String,
    },

    /// Reject the pending tool call of a session.
    Reject {
        /// Session ID.
        id: String,
    },

    /// List sessions left resumable by a previous process.
    Recover,

    /// Purge terminal sessions older than the retention window.
    Purge {
        /// Override `retention_days` from the configuration.
        #[arg(long)]
        days: Option<u32>,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    let db = Arc::new(db::open(&config).await?);
    info!("database connected");

    match args.command {
        Command::Sessions { status } => {
            let sessions = SessionRepo::new(db)
                .list(status.map(SessionStatus::from))
                .await?;
            print_json(&sessions)
        }
        Command::Show { id } => show(db, &id).await,
        Command::Events { id, from } => {
            let mut replay = EventRepo::new(db)
                .replay(&id, from)
                .page_size(config.runtime.replay_page_size);
            while let Some(event) = replay.next().await? {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(())
        }
        Command::Verify { id } => verify(db, &id).await,
        Command::Approve { id } => decide(db, &id, Decision::Approve).await,
        Command::Reject { id } => decide(db, &id, Decision::Reject).await,
        Command::Recover => recover(db).await,
        Command::Purge { days } => {
            let removed = retention::purge(&db, days.unwrap_or(config.retention_days)).await?;
            println!("purged {removed} session(s)");
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct SessionView<T, A> {
    session: T,
    approvals: A,
}

async fn show(db: Arc<Database>, id: &str) -> Result<()> {
    let session = SessionRepo::new(Arc::clone(&db))
        .get_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;
    let approvals = ApprovalRepo::new(db).list_for_session(id).await?;
    print_json(&SessionView {
        session,
        approvals,
    })
}

async fn verify(db: Arc<Database>, id: &str) -> Result<()> {
    let session = SessionRepo::new(Arc::clone(&db))
        .get_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;
    let events = EventRepo::new(db).list(id).await?;
    let rebuilt = reconstruct(&events);

    if rebuilt.status != session.status {
        return Err(AppError::Db(format!(
            "status mismatch: log says {}, session says {}",
            rebuilt.status.as_str(),
            session.status.as_str()
        )));
    }
    if rebuilt.pending_approval != session.pending_approval {
        return Err(AppError::Db("pending approval marker mismatch".into()));
    }
    if rebuilt.messages != session.messages {
        return Err(AppError::Db(format!(
            "message mismatch: log has {}, session has {}",
            rebuilt.messages.len(),
            session.messages.len()
        )));
    }
    println!(
        "ok: {} event(s), {} message(s), status {}",
        events.len(),
        session.messages.len(),
        session.status.as_str()
    );
    Ok(())
}

async fn decide(db: Arc<Database>, id: &str, decision: Decision) -> Result<()> {
    let outcome = ApprovalGate::new(db).submit_decision(id, decision).await?;
    info!(session_id = id, ?outcome, "decision submitted");
    println!("{}: recorded for session {id}", decision.as_str());
    Ok(())
}

async fn recover(db: Arc<Database>) -> Result<()> {
    let decided: Vec<String> = ApprovalRepo::new(Arc::clone(&db))
        .list_decided_unapplied()
        .await?
        .into_iter()
        .map(|request| request.session_id)
        .collect();
    for session in SessionRepo::new(db).list_resumable().await? {
        let note = match session.status {
            SessionStatus::WaitingApproval if decided.contains(&session.id) => {
                "decision recorded, start to apply"
            }
            SessionStatus::WaitingApproval => "awaiting decision",
            _ => "interrupted",
        };
        println!("{}\t{}\t{note}", session.id, session.status.as_str());
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
