use std::sync::Arc;
use anyhow::{anyhow, Result};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod config;
mod conversation;
mod gateway;
mod gemini;
mod handler;
mod persona;
mod tui;
mod ui;

use app::App;
use config::Config;
use conversation::ChatController;
use gemini::{GeminiClient, DEFAULT_BASE_URL, DEFAULT_MODEL};
use persona::Persona;

#[derive(Parser)]
#[command(name = "finbot")]
#[command(version, about = "Personal finance assistant in your terminal, powered by Gemini")]
struct Cli {
    /// Skip the profile picker: student or professional
    #[arg(short, long)]
    persona: Option<String>,

    /// Gemini model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Override the Gemini API base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

/// Log to a file; the terminal belongs to the TUI.
fn init_logging() -> Result<WorkerGuard> {
    let log_dir = Config::config_dir()?;
    std::fs::create_dir_all(&log_dir)?;

    let appender = tracing_appender::rolling::never(&log_dir, "finbot.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "finbot=info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let persona = match cli.persona.as_deref() {
        Some(name) => Some(
            Persona::from_str(name)
                .ok_or_else(|| anyhow!("unknown persona '{}', expected student or professional", name))?,
        ),
        None => None,
    };

    let _log_guard = init_logging()?;

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not read config, using defaults");
        Config::new()
    });

    let client = GeminiClient::new(config.resolve_api_key(cli.api_key))
        .with_model(cli.model.or(config.model).unwrap_or_else(|| DEFAULT_MODEL.to_string()))
        .with_base_url(cli.base_url.or(config.base_url).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()));

    if !client.has_api_key() {
        tracing::warn!("no Gemini API key configured");
    }
    tracing::info!(model = client.model(), "starting finbot");

    let (chat, chat_updates) = ChatController::new(Arc::new(client.clone()));
    let mut app = App::new(chat, client);
    if let Some(persona) = persona {
        app.select_persona(persona);
    }

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = tui::EventHandler::new(chat_updates);

    let result = run(&mut terminal, &mut app, &mut events).await;

    tui::restore()?;
    result
}

async fn run(terminal: &mut tui::Tui, app: &mut App, events: &mut tui::EventHandler) -> Result<()> {
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        match events.next().await {
            Some(event) => handler::handle_event(app, event),
            None => break,
        }
    }
    Ok(())
}
