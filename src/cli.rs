use clap::Parser;
use std::path::PathBuf;

use crate::message::SessionId;

#[derive(Parser, Debug)]
#[command(name = "career-chat")]
#[command(version)]
#[command(about = "Terminal client for the CareerGPT career-advice chat backend")]
pub struct Args {
    /// Message to send. Without one, an interactive session starts.
    pub prompt: Option<String>,

    /// Session to open: a numeric id, or "new" for a fresh chat
    #[arg(long, short, default_value = "new")]
    pub session: SessionId,

    /// Upload a résumé (.pdf, .doc, .docx) for analysis
    #[arg(long, value_name = "PATH")]
    pub upload: Option<PathBuf>,

    /// List your chat sessions and exit
    #[arg(long)]
    pub list: bool,

    /// Rename the session given by --session
    #[arg(long, value_name = "TITLE")]
    pub rename: Option<String>,

    /// Delete the session given by --session
    #[arg(long)]
    pub delete: bool,

    /// Log in; the password is read from CAREER_CHAT_PASSWORD or stdin
    #[arg(long, value_name = "EMAIL")]
    pub login: Option<String>,

    /// Register a new account; the password is read like --login
    #[arg(long, value_name = "EMAIL")]
    pub register: Option<String>,

    /// Forget the stored token
    #[arg(long)]
    pub logout: bool,

    /// Backend base URL (overrides config file and environment)
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Config file (default: ~/.career-chat/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Seconds without stream data before a reply is abandoned
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub idle_timeout: Option<u64>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl Args {
    /// Whether the run sends nothing and only manages account or sessions.
    pub fn is_management(&self) -> bool {
        self.list || self.rename.is_some() || self.delete || self.login.is_some() || self.register.is_some() || self.logout
    }
}

/// A line typed at the interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Send(String),
    Upload(PathBuf),
    New,
    Open(SessionId),
    Title(String),
    List,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ReplCommand::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return ReplCommand::Send(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((n, a)) => (n, a.trim()),
            None => (rest, ""),
        };
        match (name, arg) {
            ("upload", path) if !path.is_empty() => ReplCommand::Upload(PathBuf::from(path)),
            ("new", _) => ReplCommand::New,
            ("open", id) => match id.parse::<SessionId>() {
                Ok(sid) if !id.is_empty() => ReplCommand::Open(sid),
                _ => ReplCommand::Unknown(line.to_string()),
            },
            ("title", title) if !title.is_empty() => ReplCommand::Title(title.to_string()),
            ("list", _) => ReplCommand::List,
            ("help", _) => ReplCommand::Help,
            ("quit" | "exit", _) => ReplCommand::Quit,
            _ => ReplCommand::Unknown(line.to_string()),
        }
    }
}

pub const REPL_HELP: &str = "\
/upload <path>  analyse a résumé
/new            start a new chat
/open <id>      switch to a saved chat
/title <text>   rename this chat
/list           list saved chats
/quit           leave
Ctrl-C cancels a reply in progress.";
