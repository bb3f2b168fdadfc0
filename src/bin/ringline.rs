//! Command-line entry point: place a call, or listen for incoming calls.

use clap::{Parser, Subcommand};
use ringline::agent::{CallAgent, CallRequest};
use ringline::audio::router::AudioRouter;
use ringline::config::AgentConfig;
use ringline::engine::ConversationEngine;
use ringline::models::{AnthropicLlm, HttpStt, HttpTts, ModelTier};
use ringline::modem::ModemController;
use ringline::phone::PhoneNumber;
use ringline::settings::Settings;
use ringline::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ringline", about = "AI phone agent over a cellular modem")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the owner settings JSON file.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Place an outbound call.
    Call {
        /// Phone number to dial.
        phone: String,
        /// What the call should accomplish.
        objective: String,
        /// Context key/value pairs, repeatable.
        #[arg(long = "context", num_args = 2, value_names = ["KEY", "VALUE"])]
        context: Vec<String>,
    },
    /// Answer incoming calls with the configured persona.
    Listen,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => default_config(),
    };
    let settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let store = Store::open(&config.store_path)?;
    let modem = ModemController::over_usb(config.modem.clone());
    let router = Arc::new(AudioRouter::new(config.audio.clone()));

    let engine = ConversationEngine::new(
        &config.vad,
        config.conversation.clone(),
        config.audio.pipeline_sample_rate,
        Box::new(HttpStt::new(config.stt.clone())),
        Box::new(HttpTts::new(config.tts.clone())),
        Box::new(AnthropicLlm::new(&config.llm, ModelTier::Fast)),
    );

    let agent = CallAgent::new(config, settings, modem, router, engine, store);

    match cli.command {
        Command::Call {
            phone,
            objective,
            context,
        } => {
            let number = PhoneNumber::normalize(&phone);
            if number.is_empty() {
                anyhow::bail!("'{phone}' contains no digits");
            }

            let context: Vec<(String, String)> = context
                .chunks_exact(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();

            let result = agent.call(&CallRequest {
                phone: number,
                objective,
                context,
            });

            println!("success: {}", result.success);
            println!("duration: {:.1}s", result.duration_seconds);
            if !result.summary.is_empty() {
                println!("summary: {}", result.summary);
            }
            if !result.collected_info.is_empty() {
                println!(
                    "collected: {}",
                    serde_json::to_string_pretty(&result.collected_info)?
                );
            }
            if let Some(path) = &result.recording_path {
                println!("recording: {}", path.display());
            }

            if result.success {
                Ok(())
            } else {
                anyhow::bail!("call did not succeed: {}", result.summary)
            }
        }
        Command::Listen => {
            agent.listen()?;
            Ok(())
        }
    }
}

fn default_config() -> AgentConfig {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ringline");
    let mut config = AgentConfig::default();
    config.calls_dir = data_dir.join("calls");
    config.store_path = data_dir.join("ringline.db");
    config.knowledge_dir = data_dir.join("knowledge");
    config
}
