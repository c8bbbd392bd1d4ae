//! Chatwire CLI - line-oriented terminal client for the AI chat backend.
//!
//! This is the entry point for the `chatwire` binary. Answers stream to stdout; logs go
//! to stderr so they never interleave with the transcript.

mod app;
mod render;

use clap::Parser;
use chatwire_core::{ChatId, ClientType};
use chatwire_transport::TransportConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use app::{App, Flow, Input, HELP};
use render::Transcript;

/// Chatwire CLI - ask questions and watch the answers stream in.
#[derive(Parser, Debug)]
#[command(name = "chatwire")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Access token for authentication.
    #[arg(long, env = "CHATWIRE_TOKEN")]
    token: String,

    /// WebSocket endpoint of the chat channel.
    #[arg(long, env = "CHATWIRE_WS_URL")]
    ws_url: Option<String>,

    /// Base URL of the REST API.
    #[arg(long, env = "CHATWIRE_API_URL")]
    api_url: Option<String>,

    /// Client platform (WECHAT_MP, PC or APP).
    #[arg(long, env = "CHATWIRE_CLIENT_TYPE")]
    client_type: Option<ClientType>,

    /// Chat to continue; a new chat is created on the first question otherwise.
    #[arg(long, env = "CHATWIRE_CHAT_ID")]
    chat_id: Option<String>,

    /// User owning the chats, for history and chat list calls.
    #[arg(long, env = "CHATWIRE_USER_ID", default_value = "")]
    user_id: String,

    /// Enable debug logging.
    #[arg(long, default_value = "false")]
    debug: bool,
}

impl Args {
    fn config(&self) -> TransportConfig {
        let mut config = TransportConfig::from_env();
        if let Some(url) = &self.ws_url {
            config.ws_url.clone_from(url);
        }
        if let Some(url) = &self.api_url {
            config.api_base_url.clone_from(url);
        }
        if let Some(client_type) = self.client_type {
            config.client_type = client_type;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "chatwire=debug,warn" } else { "chatwire=info,warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = args.config();
    let chat_id = args.chat_id.clone().map(ChatId::new).transpose()?;
    let mut app = App::new(&config, &args.token, args.user_id.clone(), chat_id)?;

    app.connection.connect(config.client_type).await?;
    println!("{HELP}");

    let result = run_loop(&mut app).await;

    if let Err(e) = app.connection.disconnect().await {
        tracing::warn!(error = %e, "Disconnect failed");
    }
    result
}

/// Read stdin lines while printing slot updates and connection events as they arrive.
async fn run_loop(app: &mut App) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut updates = app.session.updates();
    let mut events = app.connection.events();
    let mut transcript = Transcript::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let Some(input) = Input::parse(&line) else {
                    continue;
                };
                match app.handle(input).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) => eprintln!("error: {e:#}"),
                }
            }

            update = updates.recv() => match update {
                Ok(update) => {
                    if let Some(text) = transcript.render(&update) {
                        println!("{text}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Display fell behind, some updates were skipped");
                }
                Err(RecvError::Closed) => break,
            },

            event = events.recv() => match event {
                Ok(event) => eprintln!("* {}", render::render_event(&event)),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}
