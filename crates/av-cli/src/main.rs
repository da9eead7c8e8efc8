use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use av_core::{AgentConfigInput, FunctionToolConfig, ModelConfig, ToolConfig};
use av_providers::ModelGroup;

mod app;
mod chat;
mod chat_store;
mod config;
mod executors;
mod setup;

use app::App;
use config::Settings;

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: every stream event and store call
    Trace,
    /// Verbose: flushes, agent builds, tool calls
    Debug,
    /// Standard: startup, sends, provider resets
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "av")]
#[command(author, version, about = "Agent vault: chat with your configured agents", long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Write logs to file (JSON-lines format)
    #[arg(long)]
    pub log_file: Option<std::path::PathBuf>,

    /// Agent to select at start (overrides config)
    #[arg(short = 'A', long)]
    pub agent: Option<String>,

    /// Model to select at start, as <provider>:<model> (overrides config)
    #[arg(short, long)]
    pub model: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage stored agents
    Agents {
        #[command(subcommand)]
        action: AgentsCommand,
    },
    /// List the models of every usable provider
    Models,
    /// Show current configuration
    Config,
    /// Write a starter config file to ~/.config/agent-vault
    Setup,
}

#[derive(Subcommand)]
enum AgentsCommand {
    /// Create an agent
    Create {
        #[arg(long)]
        name: String,

        #[arg(long)]
        instructions: String,

        /// Provider id
        #[arg(long, default_value = "openai-default")]
        provider: String,

        /// Model id
        #[arg(long, default_value = "gpt-5")]
        model: String,

        /// Built-in function tool to attach (repeatable)
        #[arg(long = "tool")]
        tools: Vec<String>,

        /// Agent id this agent may hand off to (repeatable)
        #[arg(long = "handoff")]
        handoffs: Vec<String>,
    },
    /// List agents
    List,
    /// Delete an agent
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter()));

    if let Some(log_path) = &cli.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    // Handle setup before config is required
    if matches!(&cli.command, Some(Commands::Setup)) {
        return setup::run();
    }

    let mut settings = Settings::load()?;
    if cli.agent.is_some() {
        settings.default_agent_id = cli.agent.clone();
    }
    if cli.model.is_some() {
        settings.default_model_key = cli.model.clone();
    }

    match cli.command {
        Some(Commands::Config) => show_config(&settings),
        Some(Commands::Agents { action }) => {
            let app = App::open(&settings).await?;
            agents_command(&app, action).await
        }
        Some(Commands::Models) => {
            let app = App::open(&settings).await?;
            let groups = app.providers.available_model_groups().await;
            if groups.is_empty() {
                println!("No usable providers. Enable one and set its API key with `av setup`.");
            }
            for line in model_lines(&groups) {
                println!("{}", line);
            }
            Ok(())
        }
        Some(Commands::Setup) => Ok(()),
        None => chat_mode(&settings).await,
    }
}

async fn chat_mode(settings: &Settings) -> Result<()> {
    let app = App::open(settings).await?;
    let store = app.chat_store(settings).await;

    let result = chat::run_chat(store.clone()).await;

    if let Err(e) = store.shutdown().await {
        warn!(error = %e, "Some sessions could not be saved");
        eprintln!("Warning: some conversation items could not be saved: {}", e);
    }
    result
}

async fn agents_command(app: &App, action: AgentsCommand) -> Result<()> {
    match action {
        AgentsCommand::Create {
            name,
            instructions,
            provider,
            model,
            tools,
            handoffs,
        } => {
            let mut input = AgentConfigInput::new(name, instructions, ModelConfig::new(provider, model));
            input.tools = tools
                .into_iter()
                .map(|t| ToolConfig::Function(FunctionToolConfig::new(t)))
                .collect();
            input.handoff_ids = handoffs;

            let created = app.agents.create_agent(input).await.context("Failed to create agent")?;
            println!("{}", created.id);
        }
        AgentsCommand::List => {
            let agents = app.agents.list_agents();
            if agents.is_empty() {
                println!("No agents configured.");
            }
            for agent in agents {
                println!(
                    "{}  {}  {}:{}  {} tools",
                    agent.id,
                    agent.name,
                    agent.model_config.provider,
                    agent.model_config.model,
                    agent.tools.len()
                );
            }
        }
        AgentsCommand::Delete { id } => {
            app.agents.delete_agent(&id).await.context("Failed to delete agent")?;
            println!("Deleted {}", id);
        }
    }
    Ok(())
}

fn show_config(settings: &Settings) -> Result<()> {
    println!("Configuration file: {}", Settings::config_path()?.display());
    println!("Database: {}", settings.database_path().display());
    println!("Notes root: {}\n", settings.notes_root().display());

    let rendered = toml::to_string_pretty(settings).context("Failed to render configuration")?;
    println!("{}", redact_keys(&rendered));
    Ok(())
}

/// One heading per provider, then its models by selectable key.
fn model_lines(groups: &[ModelGroup]) -> Vec<String> {
    let mut lines = Vec::new();
    for group in groups {
        lines.push(format!("{} ({})", group.provider_name, group.provider_id));
        for model in &group.models {
            lines.push(format!("  {}  {}", model.key, model.display_name));
        }
    }
    lines
}

/// Hide literal API keys in rendered configuration.
fn redact_keys(rendered: &str) -> String {
    rendered
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("api_key =") {
                "api_key = \"***\"".to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use av_providers::ModelOption;

    #[test]
    fn test_cli_parses_agent_create() {
        let cli = Cli::try_parse_from([
            "av", "agents", "create", "--name", "Librarian", "--instructions", "Help.",
            "--tool", "read_note", "--tool", "list_notes",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Agents {
                action: AgentsCommand::Create { name, tools, model, .. },
            }) => {
                assert_eq!(name, "Librarian");
                assert_eq!(tools, vec!["read_note", "list_notes"]);
                assert_eq!(model, "gpt-5");
            }
            _ => panic!("expected agents create"),
        }
        assert_eq!(cli.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_model_lines() {
        let groups = vec![ModelGroup {
            provider_id: "openai-default".into(),
            provider_name: "OpenAI".into(),
            models: vec![ModelOption {
                key: "openai-default:gpt-5".into(),
                display_name: "GPT-5".into(),
                model_id: "gpt-5".into(),
            }],
        }];
        assert_eq!(
            model_lines(&groups),
            vec!["OpenAI (openai-default)", "  openai-default:gpt-5  GPT-5"]
        );
        assert!(Cli::try_parse_from(["av", "models"]).is_ok());
    }

    #[test]
    fn test_redact_keys() {
        let out = redact_keys("[[providers]]\napi_key = \"sk-secret\"\napi_key_env = \"OPENAI_API_KEY\"");
        assert!(!out.contains("sk-secret"));
        assert!(out.contains("api_key_env = \"OPENAI_API_KEY\""));
    }
}
