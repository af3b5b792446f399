//! `chatlink` line-mode client.
//!
//! Reads lines from stdin and sends them to the backend; replies, typing
//! and connection changes are printed as they arrive. Commands:
//!
//! - `/clear`: forget the local conversation
//! - `/email <address>`: leave an email after an ended session
//! - `/reconnect`: open a new session
//! - `/quit`: disconnect and exit

use std::io;
use std::path::Path;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;

use chatlink::client::ChatClient;
use chatlink::config::{CliArgs, ClientConfig};
use chatlink::connection::ConnectionState;
use chatlink::session::SessionIdentity;
use chatlink::store::{ChatState, FileStateStore, InMemoryStateStore, MessageKind, StateStore};
use chatlink::transport::websocket::WebSocketConnector;
use chatlink_proto::message::ClientId;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Logs go to a file; stdout belongs to the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!(server_url = %config.server_url, "chatlink starting");

    let identity = match config.identity_path.as_deref() {
        Some(path) => match SessionIdentity::load_or_create(path) {
            Ok(identity) => identity,
            Err(e) => {
                eprintln!("Error loading client identity: {e}");
                std::process::exit(1);
            }
        },
        None => SessionIdentity::new(ClientId::generate()),
    };

    match config.state_path.clone() {
        Some(path) => run(&config, identity, FileStateStore::new(path)).await,
        None => run(&config, identity, InMemoryStateStore::new()).await,
    }
}

/// Initialize file-based logging.
///
/// Returns a guard that must be held for the lifetime of the application
/// to ensure logs are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("chatlink.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Connect, then forward stdin lines until `/quit` or end of input.
async fn run<S: StateStore>(
    config: &ClientConfig,
    identity: SessionIdentity,
    persistence: S,
) -> io::Result<()> {
    let connector = WebSocketConnector::new(&config.server_url)
        .with_connect_timeout(config.connect_timeout);
    let client = ChatClient::start(
        connector,
        identity,
        persistence,
        config.to_connection_config(),
    )
    .await;

    let printer = tokio::spawn(print_updates(
        client.subscribe(),
        client.subscribe_connection(),
        client.client_id().clone(),
    ));

    if let Err(e) = client.connect().await {
        eprintln!("Error: {e}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest.trim())) {
            ("/quit", _) => break,
            ("/clear", _) => client.clear_messages().await,
            ("/email", address) => {
                if let Err(e) = client.set_email(address).await {
                    println!("! {e}");
                }
            }
            ("/reconnect", _) => {
                if let Err(e) = client.connect().await {
                    println!("! {e}");
                }
            }
            ("", _) => {}
            _ => {
                // Confirmation arrives through the store; the future is not awaited.
                if let Err(e) = client.send_message(line, Vec::new()).await {
                    println!("! {e}");
                }
            }
        }
    }

    if let Err(e) = client.disconnect().await {
        tracing::warn!(err = %e, "disconnect on exit failed");
    }
    client.shutdown().await;
    printer.abort();
    tracing::info!("chatlink exiting");
    Ok(())
}

/// Print new messages and changes of typing, errors and connection status.
async fn print_updates(
    mut chat: watch::Receiver<ChatState>,
    mut connection: watch::Receiver<ConnectionState>,
    client_id: ClientId,
) {
    let mut printed = chat.borrow().messages.len();
    let mut typing = false;
    let mut last_error: Option<String> = None;
    let mut prompted = false;

    loop {
        tokio::select! {
            changed = chat.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = chat.borrow_and_update().clone();
                printed = printed.min(state.messages.len());
                for message in &state.messages[printed..] {
                    match message.kind {
                        MessageKind::System => println!("* {}", message.content),
                        MessageKind::Content if message.is_from(&client_id) => {}
                        MessageKind::Content => println!("bot> {}", message.content),
                    }
                }
                printed = state.messages.len();

                if state.is_typing && !typing {
                    println!("  ...");
                }
                typing = state.is_typing;

                if state.error != last_error {
                    if let Some(error) = &state.error {
                        println!("! {error}");
                    }
                    last_error = state.error;
                }

                if state.show_email_prompt && !prompted {
                    println!("* Leave your email with /email <address> and we will follow up.");
                }
                prompted = state.show_email_prompt;
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = connection.borrow_and_update().status;
                println!("* {status}");
            }
        }
    }
}
