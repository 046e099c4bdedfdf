use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Instrument;

use session_recorder::config::{StoragePaths, new_session_id, project_hash};
use session_recorder::observability::{TracingLevel, init_tracing, session_span};
use session_recorder::session::commands::{EXIT_FAILURE, EXIT_SUCCESS};
use session_recorder::session::shutdown::install_shutdown_handler;
use session_recorder::session::{
    CommandContext, cleanup_command, continue_command, delete_session_command,
    list_sessions_command,
};
use session_recorder::types::Content;
use session_recorder::{
    HistoryService, RecordingConfig, RecordingSession, ResumeRequest, RetentionPolicy, SyncMode,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "session-recorder")]
#[command(about = "Record, list, resume and delete conversation sessions")]
#[command(version)]
struct Cli {
    /// Resume a session by ID, ID prefix or list index (newest free session if omitted)
    #[arg(long = "continue", value_name = "SESSION", num_args = 0..=1, default_missing_value = "")]
    continue_session: Option<String>,

    /// List this project's sessions
    #[arg(long, conflicts_with_all = ["continue_session", "delete_session", "cleanup"])]
    list_sessions: bool,

    /// Delete a session by ID, ID prefix or list index
    #[arg(long, value_name = "SESSION", conflicts_with_all = ["continue_session", "cleanup"])]
    delete_session: Option<String>,

    /// Apply the retention policy to this project's sessions
    #[arg(long, conflicts_with = "continue_session")]
    cleanup: bool,

    /// Delete sessions not modified for this many days (with --cleanup)
    #[arg(long, requires = "cleanup")]
    max_age_days: Option<i64>,

    /// Keep at most this many sessions (with --cleanup)
    #[arg(long, requires = "cleanup")]
    max_count: Option<usize>,

    /// Project root the sessions belong to
    #[arg(long, env = "SESSION_RECORDER_PROJECT_ROOT")]
    project_root: Option<PathBuf>,

    /// Provider of the current invocation
    #[arg(long, default_value = "local")]
    provider: String,

    /// Model of the current invocation
    #[arg(long, default_value = "echo")]
    model: String,

    /// Sync the session file to disk after every write
    #[arg(long)]
    fsync: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(TracingLevel::from_verbosity(cli.verbose)) {
        eprintln!("{}", e);
    }

    ExitCode::from(run(cli).await as u8)
}

async fn run(cli: Cli) -> i32 {
    let root = match cli.project_root.clone() {
        Some(root) => root,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("Error: cannot determine project root: {}", e);
                return EXIT_FAILURE;
            }
        },
    };
    let paths = match StoragePaths::from_env() {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("Error: {}", e);
            return EXIT_FAILURE;
        }
    };
    let chats_dir = paths.chats_dir(&root);
    let hash = project_hash(&root);
    let ctx = CommandContext::new(&chats_dir, &hash);

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    if cli.list_sessions {
        return list_sessions_command(&ctx, &mut stdout, &mut stderr);
    }
    if let Some(reference) = &cli.delete_session {
        return delete_session_command(&ctx, reference, &mut stdout, &mut stderr);
    }
    if cli.cleanup {
        let mut policy = RetentionPolicy::new();
        if let Some(days) = cli.max_age_days {
            policy = policy.max_age_days(days);
        }
        if let Some(count) = cli.max_count {
            policy = policy.max_count(count);
        }
        if policy.is_empty() {
            eprintln!("Error: --cleanup needs --max-age-days and/or --max-count");
            return EXIT_FAILURE;
        }
        return cleanup_command(&ctx, &policy, &mut stdout, &mut stderr);
    }

    let config = match RecordingConfig::builder()
        .session_id(new_session_id())
        .project_hash(&hash)
        .chats_dir(&chats_dir)
        .workspace_dirs([root.to_string_lossy().into_owned()])
        .provider(&cli.provider)
        .model(&cli.model)
        .sync_mode(if cli.fsync {
            SyncMode::OnWrite
        } else {
            SyncMode::None
        })
        .build()
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return EXIT_FAILURE;
        }
    };

    let (session, history) = match cli.continue_session {
        Some(reference) => {
            let mut request = ResumeRequest::new(config);
            if !reference.is_empty() {
                request = request.with_reference(reference);
            }
            match continue_command(&ctx, request, &mut stdout, &mut stderr).await {
                Ok(resumed) => RecordingSession::from_resumed(resumed),
                Err(code) => return code,
            }
        }
        None => {
            let history = HistoryService::new();
            match RecordingSession::start(config, &history, &ctx.locks) {
                Ok(session) => (session, history),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return EXIT_FAILURE;
                }
            }
        }
    };

    let session = Arc::new(session);
    install_shutdown_handler(session.clone(), SHUTDOWN_TIMEOUT);
    let span = session_span(session.session_id());
    record_stdin(&session, history).instrument(span).await
}

/// Record each stdin line as one user turn until EOF.
async fn record_stdin(session: &RecordingSession, mut history: HistoryService) -> i32 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut code = EXIT_SUCCESS;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                history.add(Content::user(line));
                if let Err(e) = session.integration().flush_at_turn_boundary().await {
                    eprintln!("Error: {}", e);
                    code = EXIT_FAILURE;
                    break;
                }
                if let Some(notice) = session.recording().take_disabled_notice() {
                    eprintln!("Warning: {}", notice);
                }
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("Error: reading input: {}", e);
                code = EXIT_FAILURE;
                break;
            }
        }
    }

    if let Err(e) = session.close().await {
        eprintln!("Error: {}", e);
        code = EXIT_FAILURE;
    }
    if let Some(path) = session.recording().get_file_path() {
        eprintln!("Session {} saved to {}", session.session_id(), path.display());
    }
    code
}
