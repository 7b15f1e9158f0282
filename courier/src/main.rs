//! `courier`: line-mode chat client.
//!
//! Opens one conversation, prints the timeline as it changes, and sends
//! every line typed on stdin. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/courier/config.toml`).
//!
//! ```bash
//! cargo run --bin courier -- --user 1 --peer 2 \
//!     --broker-url ws://127.0.0.1:9000/ws --history-url http://127.0.0.1:9000
//! ```
//!
//! Commands: `/list` reprints the timeline, `/retry <seq>` republishes a
//! failed message, `/quit` exits.

use std::io;
use std::path::Path;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use courier::chat::{ChatEvent, DeliveryState, Message};
use courier::config::{CliArgs, ClientConfig};
use courier::facade::{Conversation, Courier, HistoryStatus};
use courier::history::{HistorySource, HttpHistorySource};
use courier::transport::Transport;
use courier::transport::websocket::WebSocketTransport;
use courier_proto::message::ClientSeq;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file; stdout is the chat surface.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let session = config.session().map_err(io::Error::other)?;
    tracing::info!(user = %session.user, peer = %session.peer, "courier starting");

    let transport = WebSocketTransport::new(session.broker_url.as_str())
        .with_timeouts(config.connect_timeout, config.handshake_timeout);
    let history = HttpHistorySource::with_timeout(session.history_url.as_str(), config.history_timeout)
        .map_err(io::Error::other)?;

    let courier = Courier::new(transport, history, config.courier_config());
    let conversation = courier
        .open(session.user.clone(), session.peer.clone())
        .await
        .map_err(io::Error::other)?;

    if let HistoryStatus::Unavailable { reason } = conversation.history_status() {
        println!("! history unavailable: {reason}");
    }
    print_timeline(&conversation);
    conversation.subscribe(print_event);

    let result = run(&conversation).await;

    conversation.close().await;
    tracing::info!("courier exiting");
    result
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("courier.log");
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

/// Read stdin until EOF or `/quit`.
async fn run<T: Transport, H: HistorySource>(conversation: &Conversation<T, H>) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest.trim())) {
            ("/quit", _) => break,
            ("/list", _) => print_timeline(conversation),
            ("/retry", arg) => match arg.parse::<u64>() {
                Ok(seq) => {
                    if let Err(e) = conversation.retry(ClientSeq::new(seq)) {
                        println!("! {e}");
                    }
                }
                Err(_) => println!("! usage: /retry <seq>"),
            },
            _ => {
                if let Err(e) = conversation.send(line) {
                    println!("! {e}");
                }
            }
        }
    }
    Ok(())
}

fn print_timeline<T: Transport, H: HistorySource>(conversation: &Conversation<T, H>) {
    println!(
        "-- {} ({}) --",
        conversation.key(),
        conversation.connection_state()
    );
    for message in &conversation.messages() {
        println!("{}", render(message));
    }
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::Appended { message, .. } => println!("{}", render(message)),
        ChatEvent::Updated { message, .. } => println!("~ {}", render(message)),
        ChatEvent::Removed { index } => println!("~ entry {index} merged"),
        ChatEvent::ConnectionChanged(state) => println!("* connection {state}"),
        ChatEvent::HistoryLoaded { .. } | ChatEvent::HistoryUnavailable { .. } => {}
    }
}

fn render(message: &Message) -> String {
    let tag = message
        .client_seq
        .map_or_else(String::new, |seq| format!(" {seq}"));
    let state = match &message.delivery {
        DeliveryState::Pending => " (sending)".to_string(),
        DeliveryState::Confirmed => String::new(),
        DeliveryState::Failed { reason } => format!(" (failed: {reason})"),
    };
    format!("{}{tag}: {}{state}", message.sender_id, message.content)
}
