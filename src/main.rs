use clap::Parser;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use agent_chat::cli::{handlers, Cli, Commands};
use agent_chat::{Config, Result};

fn init_tracing(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("agent_chat=info".parse()?);

    match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            // stdout carries the streamed answer
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let config = Config::load()?.with_server(cli.server.clone());
    tracing::debug!("Using agent service at {}", config.server.base_url);

    match cli.command {
        Commands::Send { text, session } => handlers::send(config, text, session).await,
        Commands::Chat { session } => handlers::chat(config, session).await,
        Commands::Sessions { filter } => handlers::list_sessions(config, filter).await,
        Commands::History { session_id } => handlers::show_history(config, session_id).await,
        Commands::Rename { session_id, title } => {
            handlers::rename_session(config, session_id, title).await
        }
        Commands::Delete { session_id, yes } => {
            handlers::delete_session(config, session_id, yes).await
        }
        Commands::Models => handlers::list_models(config).await,
        Commands::Pull { name } => handlers::pull_model(config, name).await,
        Commands::Config { save } => handlers::show_config(config, save),
    }
}
