#![deny(unsafe_code)]

mod error;
mod render;
mod repl;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use snafu::ResultExt;
use tracing_subscriber::EnvFilter;

use crate::error::{CliResult, SettingsSnafu};
use crate::settings::{ClientSettings, SettingsStore};

/// Chat with an OpenAssistants assistant from the terminal.
#[derive(Debug, Parser)]
#[command(name = "opas", version)]
struct Cli {
    /// Settings file (defaults to the user config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[arg(long, global = true)]
    assistant: Option<String>,
    /// Bearer token sent with every request.
    #[arg(long, global = true)]
    token: Option<String>,
    /// Ask for whole responses instead of an event stream.
    #[arg(long, global = true)]
    no_stream: bool,
    /// Write the effective settings back to the settings file.
    #[arg(long, global = true)]
    save: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Command {
    /// Interactive chat (default).
    Chat,
    /// List the functions the assistant can run.
    Functions,
}

impl Cli {
    fn apply_overrides(&self, mut settings: ClientSettings) -> ClientSettings {
        if let Some(base_url) = &self.base_url {
            settings.base_url = base_url.clone();
        }
        if let Some(assistant) = &self.assistant {
            settings.assistant_id = assistant.clone();
        }
        if let Some(token) = &self.token {
            settings.api_token = token.clone();
        }
        if self.no_stream {
            settings.stream = false;
        }
        settings.normalized()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let store = match &cli.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let settings = cli.apply_overrides((*store.settings()).clone());
    if cli.save {
        store.update(settings).context(SettingsSnafu {
            stage: "save-settings",
        })?;
        println!("saved settings to {}", store.config_path().display());
    } else {
        store.replace(settings);
    }

    let settings = store.settings();
    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => repl::run(&settings).await,
        Command::Functions => repl::list_functions(&settings).await,
    }
}
