use clap::Parser;
use colored::*;
use std::io::{self, BufRead};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use career_chat::api::ApiClient;
use career_chat::bootstrap::BootstrapOutcome;
use career_chat::cli::{Args, ReplCommand, REPL_HELP};
use career_chat::config::ClientConfig;
use career_chat::controller::{StreamSessionController, TurnOutcome};
use career_chat::credentials::FileCredentials;
use career_chat::error::ChatError;
use career_chat::render::{write_session_list, TranscriptPrinter};
use career_chat::resume::ResumeFile;

const ENV_PASSWORD: &str = "CAREER_CHAT_PASSWORD";

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Logs go to stderr so they never mix with the transcript on stdout.
/// `RUST_LOG` overrides the default `warn` level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn build_config(args: &Args) -> Result<ClientConfig, ChatError> {
    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(url) = &args.base_url {
        config.set_base_url(url);
    }
    if let Some(secs) = args.idle_timeout {
        config.set_idle_timeout_secs(secs)?;
    }
    Ok(config)
}

fn read_password() -> Result<String, ChatError> {
    if let Ok(pw) = std::env::var(ENV_PASSWORD) {
        return Ok(pw);
    }
    eprint!("Password: ");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let pw = line.trim_end_matches(['\r', '\n']).to_string();
    if pw.is_empty() {
        return Err(ChatError::Validation("password is empty".to_string()));
    }
    Ok(pw)
}

// ---------------------------------------------------------------------------
// Account and session management
// ---------------------------------------------------------------------------

/// Runs the single account or session action selected by `args`.
async fn run_management(args: &Args, controller: &mut StreamSessionController, color: bool) -> Result<(), ChatError> {
    let api = controller.api();
    if args.logout {
        api.logout()?;
        println!("Logged out.");
    } else if let Some(email) = &args.register {
        let password = read_password()?;
        let user = api.register(email, &password).await?;
        api.login(email, &password).await?;
        println!("Registered and logged in as {}.", user.email.bright_green());
    } else if let Some(email) = &args.login {
        let password = read_password()?;
        api.login(email, &password).await?;
        println!("Logged in as {}.", email.bright_green());
    } else if args.list {
        let sessions = api.list_sessions().await?;
        write_session_list(&mut io::stdout().lock(), &sessions, color)?;
    } else {
        if let BootstrapOutcome::Redirected { error, .. } = controller.enter_session(args.session).await {
            return Err(error);
        }
        if let Some(title) = &args.rename {
            controller.rename(title).await?;
            println!("Renamed session {} to \"{}\".", args.session, title.trim());
        }
        if args.delete {
            controller.delete_current().await?;
            println!("Deleted session {}.", args.session);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

fn report(outcome: Result<TurnOutcome, ChatError>) {
    match outcome {
        Ok(TurnOutcome::Completed) => {}
        Ok(TurnOutcome::Cancelled) => eprintln!("{}", "(cancelled)".dimmed()),
        Ok(TurnOutcome::Failed(ChatError::Unauthorized)) => {
            eprintln!(
                "{} run `career-chat --login <email>` to sign in again.",
                ChatError::Unauthorized.to_string().bright_red()
            );
        }
        Ok(TurnOutcome::Failed(e)) => debug!(error = %e, "turn failed"),
        Err(e) => eprintln!("{}", e.to_string().bright_red()),
    }
}

async fn upload(controller: &mut StreamSessionController, path: &std::path::Path) {
    match ResumeFile::from_path(path).await {
        Ok(file) => report(controller.upload_file(&file).await),
        Err(e) => report(Err(e)),
    }
}

async fn repl(controller: &mut StreamSessionController, color: bool) -> Result<(), ChatError> {
    eprintln!("{}", "Type a message, or /help for commands.".dimmed());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match ReplCommand::parse(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Send(text) => report(controller.send_message(&text).await),
            ReplCommand::Upload(path) => upload(controller, &path).await,
            ReplCommand::New => {
                controller.enter_session(career_chat::SessionId::Draft).await;
                eprintln!("{}", "New chat.".dimmed());
            }
            ReplCommand::Open(id) => announce(controller.enter_session(id).await),
            ReplCommand::Title(title) => match controller.rename(&title).await {
                Ok(()) => eprintln!("{}", format!("Renamed to \"{title}\".").dimmed()),
                Err(e) => report(Err(e)),
            },
            ReplCommand::List => match controller.api().list_sessions().await {
                Ok(sessions) => write_session_list(&mut io::stdout().lock(), &sessions, color)?,
                Err(e) => report(Err(e)),
            },
            ReplCommand::Help => eprintln!("{REPL_HELP}"),
            ReplCommand::Quit => break,
            ReplCommand::Unknown(cmd) => eprintln!("Unknown command: {cmd} (try /help)"),
        }
    }
    Ok(())
}

fn announce(outcome: BootstrapOutcome) {
    match outcome {
        BootstrapOutcome::Draft => {}
        BootstrapOutcome::Loaded { id, messages } => info!(session_id = id, messages, "opened session"),
        BootstrapOutcome::Redirected { requested, error } => eprintln!(
            "{} {}",
            format!("Could not open session {requested}:").bright_red(),
            error
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let color = !args.no_color;
    if !color {
        colored::control::set_override(false);
    }

    let config = build_config(&args)?;
    let credentials = Arc::new(FileCredentials::load(&config.token_file));
    let api = ApiClient::new(config, credentials)?;
    let mut controller = StreamSessionController::new(api);

    if args.is_management() {
        run_management(&args, &mut controller, color).await?;
        return Ok(());
    }

    let renderer = tokio::spawn(TranscriptPrinter::new(io::stdout(), color).run(controller.subscribe()));

    // Ctrl-C aborts the reply in progress; with nothing in flight it exits.
    let canceller = controller.canceller();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !canceller.cancel() {
                std::process::exit(130);
            }
        }
    });

    announce(controller.enter_session(args.session).await);

    if let Some(path) = &args.upload {
        upload(&mut controller, path).await;
    }
    match &args.prompt {
        Some(prompt) => report(controller.send_message(prompt).await),
        None if args.upload.is_none() => repl(&mut controller, color).await?,
        None => {}
    }

    // Dropping the controller closes the event channel and ends the renderer.
    drop(controller);
    let _ = renderer.await;
    Ok(())
}
