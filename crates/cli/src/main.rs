mod chat;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "parlor")]
#[command(about = "Parlor CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the gateway (HTTP health endpoint + cable WebSocket).
    Gateway {
        /// Config file path (default: PARLOR_CONFIG_PATH or ~/.parlor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Join a chat through the gateway (interactive). Type /typing, /alert <level> <text> or /quit.
    Chat {
        /// Config file path (default: PARLOR_CONFIG_PATH or ~/.parlor/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Cable URL (default: client.url or ws://<gateway.bind>:<gateway.port>/cable)
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// User name to chat as (default: client.user, then $USER)
        #[arg(long, short)]
        user: Option<String>,

        /// Chat to join.
        #[arg(long, value_name = "ID")]
        chat: String,
    },

    /// Dispatch one JSON envelope through the chat controller locally and print what happened.
    Dispatch {
        /// Envelope JSON, e.g. '{"type":"new-message","user":"ada","body":"hi"}'
        json: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("parlor {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            url,
            user,
            chat,
        }) => {
            if let Err(e) = run_chat(config, url, user, chat).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Dispatch { json }) => {
            if let Err(e) = run_dispatch(&json) {
                log::error!("dispatch failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{} (config: {})",
        config.gateway.bind,
        config.gateway.port,
        path.display()
    );
    lib::gateway::run_gateway(config).await
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    url: Option<String>,
    user: Option<String>,
    chat_id: String,
) -> anyhow::Result<()> {
    let chat_id = chat_id.trim().to_string();
    if chat_id.is_empty() {
        anyhow::bail!("--chat must not be empty");
    }
    let (mut config, _) = lib::config::load_config(config_path)?;
    if url.is_some() {
        config.client.url = url;
    }
    let url = lib::config::resolve_cable_url(&config);
    let user = user
        .or_else(|| config.client.user.clone())
        .or_else(|| std::env::var("USER").ok())
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "anonymous".to_string());
    let token = lib::config::resolve_gateway_token(&config);
    log::info!("joining chat {} at {} as {}", chat_id, url, user);
    chat::run_chat(url, user, token, chat_id, config.client.diagnostics_path.clone()).await
}

fn run_dispatch(json: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    use lib::dispatch::{Dispatcher, LogSink};
    use std::sync::Arc;

    let raw: serde_json::Value = serde_json::from_str(json).context("parsing envelope JSON")?;
    let dispatcher: Dispatcher<chat::ChatController> = Dispatcher::new().with_sink(Arc::new(LogSink));
    let mut controller = chat::ChatController::new("local");
    let outcome = dispatcher.dispatch(&mut controller, &raw);
    println!("{}", outcome);
    Ok(())
}
