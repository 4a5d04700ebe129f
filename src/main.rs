#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, error, info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

mod credentials;
mod utils;

use crate::credentials::{identity_from_env, load_credentials, save_credentials, Credentials};
use chatsync::config::{self, EngineConfig};
use chatsync::models::{Draft, Role, SessionIdentity};
use chatsync::sync::{ChatEngine, ChatError, ConnectionStatus, EngineUpdate, HttpChatApi, WsConnector};

/// Command line arguments for chatsync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatsync: line-oriented client for the maintenance portal chat.",
    long_about = "chatsync keeps one conversation in sync with the portal backend over a socket.\n\n\
    Commands once running:\n\
    /open <peer> [role]    Open the conversation with a user\n\
    /read <id>             Mark one notification read\n\
    /readall               Mark every chat notification read\n\
    /notifications         List notifications\n\
    /typing                Tell the peer you are typing\n\
    /status                Connection and unread summary\n\
    /reconnect             Retry the socket after it gave up\n\
    /quit                  Save state and exit\n\
    Anything else is sent to the open conversation."
)]
struct Args {
    /// Directory for config.json, credentials and the unread cache
    #[arg(long, value_name = "PATH")]
    config_dir: Option<PathBuf>,

    /// User id to log in as
    #[arg(long, value_name = "ID")]
    user: Option<String>,

    /// Portal role: admin, coordinator or mechanic
    #[arg(long, value_name = "ROLE")]
    role: Option<Role>,

    /// Open the conversation with this user right after connecting
    #[arg(long, value_name = "ID")]
    peer: Option<String>,

    /// Log file (defaults to chatsync.log in the config directory)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Open { peer: String, role: Option<Role> },
    Read(String),
    ReadAll,
    Notifications,
    Typing,
    Status,
    Reconnect,
    Quit,
    Send(String),
    Invalid(String),
}

impl Command {
    fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if !line.starts_with('/') {
            return Some(Command::Send(line.to_string()));
        }

        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();
        let command = match (name, arg) {
            ("/open", Some(peer)) => match parts.next().map(str::parse::<Role>) {
                None => Command::Open { peer: peer.to_string(), role: None },
                Some(Ok(role)) => Command::Open { peer: peer.to_string(), role: Some(role) },
                Some(Err(e)) => Command::Invalid(e),
            },
            ("/open", None) => Command::Invalid("usage: /open <peer> [role]".to_string()),
            ("/read", Some(id)) => Command::Read(id.to_string()),
            ("/read", None) => Command::Invalid("usage: /read <notification-id>".to_string()),
            ("/readall", _) => Command::ReadAll,
            ("/notifications", _) => Command::Notifications,
            ("/typing", _) => Command::Typing,
            ("/status", _) => Command::Status,
            ("/reconnect", _) => Command::Reconnect,
            ("/quit", _) => Command::Quit,
            (other, _) => Command::Invalid(format!("unknown command {}", other)),
        };
        Some(command)
    }
}

/// Environment first, then saved credentials, then prompt.
/// The flag says whether the identity should be saved once the connection works.
fn resolve_identity(args: &Args) -> Result<(SessionIdentity, bool)> {
    if let Some(identity) = identity_from_env()? {
        info!("Using identity {} from environment", identity.user_id);
        return Ok((identity, false));
    }

    if let Some(creds) = load_credentials()? {
        let wanted = args.user.as_ref().map_or(true, |user| *user == creds.user_id);
        if wanted {
            if let Some(token) = creds.get_token() {
                info!("Using cached credentials for {}", creds.user_id);
                return Ok((creds.identity(&token), false));
            }
        }
    }

    let user_id = match &args.user {
        Some(user) => user.clone(),
        None => {
            eprintln!("Enter user id:");
            utils::read_line()?
        }
    };
    let role = match args.role {
        Some(role) => role,
        None => {
            eprintln!("Enter role (admin, coordinator, mechanic):");
            utils::read_line()?.parse().map_err(|e: String| anyhow!(e))?
        }
    };
    eprintln!("Enter auth token:");
    let token = utils::read_line()?;
    if user_id.is_empty() || token.is_empty() {
        return Err(anyhow!("A user id and an auth token are required"));
    }
    Ok((SessionIdentity::new(&user_id, role, &token), true))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(dir) = &args.config_dir {
        config::set_config_dir_override(dir.clone());
    }
    let dir = config::config_dir()?;
    let log_file_path = args.log_file.clone().unwrap_or_else(|| dir.join("chatsync.log"));
    utils::setup_logging(log_file_path.to_str(), LevelFilter::Debug)?;

    info!("chatsync starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    info!("Logging to file: {}", log_file_path.display());

    let engine_config = EngineConfig::load(&dir)?;
    let (identity, save_after_connect) = resolve_identity(&args)?;

    let api = HttpChatApi::new(&engine_config.api_url, &identity.auth_token, engine_config.request_timeout())?;
    let connector = WsConnector::new(&engine_config.socket_url);
    println!(
        "Connecting to {} as {} ({})... please wait...\n",
        engine_config.socket_url, identity.user_id, identity.role
    );
    let (engine, mut updates) = ChatEngine::new(identity.clone(), engine_config, Arc::new(api), Arc::new(connector));

    match engine.start().await {
        Ok(()) => {
            if save_after_connect {
                let credentials = Credentials::new(&identity.user_id, identity.role, &identity.auth_token);
                if let Err(e) = save_credentials(&credentials) {
                    eprintln!("Warning: Failed to save credentials: {}", e);
                }
            }
        }
        Err(e) => {
            error!("Initial connection failed: {}", e);
            eprintln!("Could not connect: {}\nUse /reconnect to try again.", e);
        }
    }

    if let Some(peer) = &args.peer {
        if let Err(e) = engine.open_conversation(peer, identity.role.default_peer()).await {
            eprintln!("Could not open conversation with {}: {}", peer, e);
        }
    }

    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    run_main_loop(&engine, &mut updates, &mut line_rx).await;

    engine.shutdown().await;
    info!("chatsync shut down");
    Ok(())
}

async fn run_main_loop(
    engine: &ChatEngine,
    updates: &mut mpsc::Receiver<EngineUpdate>,
    lines: &mut mpsc::Receiver<String>,
) {
    let self_id = engine.user_id();
    loop {
        tokio::select! {
            Some(update) = updates.recv() => print_update(&update, &self_id),
            line = lines.recv() => {
                let Some(line) = line else {
                    debug!("stdin closed");
                    break;
                };
                let Some(command) = Command::parse(&line) else {
                    continue;
                };
                if !handle_command(engine, command).await {
                    break;
                }
            }
        }
    }
}

/// Returns false when the user asked to quit
async fn handle_command(engine: &ChatEngine, command: Command) -> bool {
    match command {
        Command::Open { peer, role } => {
            let role = role.unwrap_or_else(|| engine.identity().role.default_peer());
            if let Err(e) = engine.open_conversation(&peer, role).await {
                println!("! {}", e);
            }
        }
        Command::Send(text) => {
            // Sends can wait on the backend; keep printing updates meanwhile
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.send_message(Draft::text(&text)).await {
                    match e {
                        ChatError::SendFailed { draft, reason } => {
                            println!("! not sent ({}): {}", reason, draft.text.unwrap_or_default())
                        }
                        other => println!("! {}", other),
                    }
                }
            });
        }
        Command::Read(id) => {
            if let Err(e) = engine.mark_notification_read(&id).await {
                println!("! {}", e);
            }
        }
        Command::ReadAll => {
            if let Err(e) = engine.mark_all_read().await {
                println!("! {}", e);
            }
        }
        Command::Notifications => {
            let notifications = engine.notifications().await;
            if notifications.is_empty() {
                println!("-- no notifications");
            }
            for notification in &notifications {
                println!("{}", utils::format_notification(notification));
            }
        }
        Command::Typing => engine.notify_typing().await,
        Command::Status => {
            println!("-- {}", describe_status(&engine.connection_status()));
            match engine.open_conversation_id().await {
                Some(conversation_id) => println!("-- open: {}", conversation_id),
                None => println!("-- no open conversation"),
            }
            for (conversation_id, count) in engine.unread_counts().await {
                if count > 0 {
                    println!("-- {} unread in {}", count, conversation_id);
                }
            }
        }
        Command::Reconnect => {
            if let Err(e) = engine.reconnect().await {
                println!("! reconnect failed: {}", e);
            }
        }
        Command::Quit => return false,
        Command::Invalid(message) => println!("! {}", message),
    }
    true
}

fn describe_status(status: &ConnectionStatus) -> String {
    match status {
        ConnectionStatus::Disconnected => "disconnected".to_string(),
        ConnectionStatus::Connecting { attempt } => format!("connecting (attempt {})", attempt),
        ConnectionStatus::Connected => "connected".to_string(),
        ConnectionStatus::Failed { reason } => format!("offline: {}", reason),
    }
}

fn print_update(update: &EngineUpdate, self_id: &str) {
    match update {
        EngineUpdate::Connection(status) => println!("-- {}", describe_status(status)),
        EngineUpdate::MessagesChanged { conversation_id, messages } => {
            println!("== {} ({} messages)", conversation_id, messages.len());
            let skip = messages.len().saturating_sub(10);
            for message in &messages[skip..] {
                println!("{}", utils::format_message(message, self_id));
            }
        }
        // Reported by the send command itself
        EngineUpdate::SendFailed { temp_id, .. } => debug!("Send of {} failed", temp_id),
        EngineUpdate::UnreadChanged { conversation_id, count, total } => {
            if *count > 0 {
                println!("-- {} unread in {} ({} total)", count, conversation_id, total);
            }
        }
        EngineUpdate::UnreadCounts { total, .. } => println!("-- {} unread", total),
        EngineUpdate::NotificationAdded(notification) => {
            println!("** {}", utils::format_notification(notification))
        }
        EngineUpdate::NotificationsChanged { unread } => debug!("{} unread notifications", unread),
        EngineUpdate::Typing { user_id, typing, .. } => {
            if *typing {
                println!("-- {} is typing...", user_id.as_deref().unwrap_or("peer"));
            }
        }
        EngineUpdate::UnreadTotal(total) => println!("-- {} unread chats", total),
        EngineUpdate::Notice(text) => println!("! {}", text),
    }
}
