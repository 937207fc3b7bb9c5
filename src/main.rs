//! sockmux CLI - inspect and exercise real-time endpoints.
//!
//! Thin binary over the `sockmux` library; all connections go through a
//! single [`ConnectionManager`].

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sockmux::constants::{SEND_OPEN_POLL_INTERVAL, SEND_OPEN_TIMEOUT};
use sockmux::{Config, ConnectionManager, Message, ReadyState};

#[derive(Parser)]
#[command(name = "sockmux")]
#[command(version, about = "Shared WebSocket subscriptions with automatic reconnection")]
struct Cli {
    /// Application origin (overrides config and SOCKMUX_ORIGIN).
    #[arg(long, global = true)]
    origin: Option<String>,

    /// Explicit WebSocket base URL (overrides config and SOCKMUX_WS_URL).
    #[arg(long, global = true)]
    ws_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the URL an endpoint resolves to.
    Resolve {
        /// Endpoint identifier, e.g. `/ws/jobs`.
        endpoint: String,
    },
    /// Subscribe to endpoints and print every message until Ctrl-C.
    Watch {
        /// One or more endpoint identifiers.
        #[arg(required = true)]
        endpoints: Vec<String>,
    },
    /// Send one JSON message to an endpoint.
    Send {
        /// Endpoint identifier.
        endpoint: String,
        /// JSON object to send.
        json: String,
    },
    /// Print the effective configuration.
    Config,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load().context("Failed to load config")?;
    if let Some(origin) = &cli.origin {
        config.origin.clone_from(origin);
    }
    if let Some(url) = &cli.ws_url {
        config.realtime_url = Some(url.clone());
    }
    Ok(config)
}

fn format_message(endpoint: &str, message: &Message) -> String {
    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
    let body = match message {
        Message::Unknown(value) => value.to_string(),
        other => format!("{other:?}"),
    };
    format!("[{timestamp}] {endpoint} {body}")
}

async fn watch(manager: &ConnectionManager, endpoints: &[String]) -> Result<()> {
    let subscriptions: Vec<_> = endpoints
        .iter()
        .map(|endpoint| {
            let label = endpoint.clone();
            manager.subscribe_fn(endpoint, move |message| {
                println!("{}", format_message(&label, message));
            })
        })
        .collect();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    log::info!("Interrupted, closing {} subscription(s)", subscriptions.len());
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    manager.shutdown();
    Ok(())
}

async fn send(manager: &ConnectionManager, endpoint: &str, json: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("Message is not valid JSON")?;
    anyhow::ensure!(value.is_object(), "Message must be a JSON object");

    let subscription = manager.subscribe_fn(endpoint, |_| {});
    anyhow::ensure!(subscription.is_active(), "Endpoint must not be empty");

    let opened = tokio::time::timeout(SEND_OPEN_TIMEOUT, async {
        while manager.ready_state(endpoint) != ReadyState::Open {
            tokio::time::sleep(SEND_OPEN_POLL_INTERVAL).await;
        }
    })
    .await;

    if opened.is_err() {
        subscription.unsubscribe();
        anyhow::bail!(
            "{} did not open within {}s",
            endpoint,
            SEND_OPEN_TIMEOUT.as_secs()
        );
    }

    manager.send(endpoint, &value);
    // Let the socket task flush before the close frame goes out.
    tokio::time::sleep(Duration::from_millis(100)).await;
    subscription.unsubscribe();
    println!("Sent to {endpoint}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Resolve { endpoint } => {
            println!("{}", config.resolver().resolve(endpoint));
        }
        Commands::Watch { endpoints } => {
            let manager = ConnectionManager::from_config(&config);
            watch(&manager, endpoints).await?;
        }
        Commands::Send { endpoint, json } => {
            let manager = ConnectionManager::from_config(&config);
            send(&manager, endpoint, json).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_watch() {
        let cli = Cli::parse_from(["sockmux", "watch", "/ws/jobs", "/ws/daemons"]);
        match cli.command {
            Commands::Watch { endpoints } => assert_eq!(endpoints, vec!["/ws/jobs", "/ws/daemons"]),
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn test_cli_global_overrides() {
        let cli = Cli::parse_from([
            "sockmux",
            "resolve",
            "/ws/jobs",
            "--origin",
            "https://jobs.example.com",
        ]);
        assert_eq!(cli.origin.as_deref(), Some("https://jobs.example.com"));
        assert!(cli.ws_url.is_none());
    }

    #[test]
    fn test_cli_watch_requires_endpoint() {
        assert!(Cli::try_parse_from(["sockmux", "watch"]).is_err());
    }

    #[test]
    fn test_format_message_unknown_is_raw_json() {
        let line = format_message(
            "/ws/jobs",
            &Message::Unknown(serde_json::json!({"type": "log_line"})),
        );
        assert!(line.ends_with(r#"/ws/jobs {"type":"log_line"}"#));
    }
}
