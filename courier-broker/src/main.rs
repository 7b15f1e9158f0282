//! `courier-broker`: pub/sub broker and history endpoint.
//!
//! Serves the WebSocket endpoint at `/ws` and conversation history at
//! `GET /messages/{a}/{b}`.
//!
//! ```bash
//! cargo run --bin courier-broker -- --bind 127.0.0.1:9000
//! ```

use std::sync::Arc;

use clap::Parser;
use courier_broker::broker::{self, BrokerState};
use courier_broker::config::{BrokerCliArgs, BrokerConfig};
use courier_broker::store::HistoryLog;

#[tokio::main]
async fn main() {
    let cli = BrokerCliArgs::parse();

    let config = match BrokerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, max_history = config.max_history, "starting courier broker");

    let history = HistoryLog::with_max_history(config.max_history);
    let state = Arc::new(BrokerState::with_history(history));

    match broker::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "broker listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "broker task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    }
}
