use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use toolbridge::agent::{GOOGLE_API_KEY_ENV, GeminiConfig, GeminiModel};
use toolbridge::{Agent, Bridge, RunEvent, config};
use tracing::{error, info, warn};

const DEFAULT_QUERY: &str = "Find flights from Atlanta to Las Vegas 2025-05-05";

#[derive(Parser, Debug)]
#[command(name = "toolbridge")]
#[command(about = "Run a tool-using agent against a stdio tool server", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (optional)
    #[arg(short, long, default_value = "toolbridge.toml")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Override log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Gemini model to reason with
    #[arg(long, env = "GEMINI_MODEL")]
    model: Option<String>,

    /// Gemini API key
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// What to ask the agent
    #[arg(default_value = DEFAULT_QUERY)]
    query: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider for reqwest
    // This must be done before any TLS client is built
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let mut config = config::load_config(&cli.config).with_context(|| {
        format!(
            "Failed to load configuration from: {}",
            cli.config.display()
        )
    })?;

    // Apply CLI overrides
    if let Some(log_level) = cli.log_level {
        config.logging.level = log_level;
    }
    if let Some(log_format) = cli.log_format {
        config.logging.format = log_format;
    }
    if let Some(model) = cli.model {
        config.agent.model = model;
    }

    // Initialize logging
    init_logging(&config.logging)?;

    // Fail fast before anything is spawned
    let api_key = cli
        .api_key
        .filter(|key| !key.is_empty())
        .with_context(|| format!("{} must be set (or pass --api-key)", GOOGLE_API_KEY_ENV))?;

    let params = config
        .server
        .to_params()
        .context("Failed to prepare tool server launch")?;

    // Build the reasoning model and agent
    let model = GeminiModel::new(GeminiConfig::new(&config.agent.model).with_api_key(api_key))
        .context("Failed to configure Gemini model")?;
    let agent = Agent::new(Arc::new(model), config.agent.agent_config());

    // Print banner
    print_banner(&config);

    // Start the tool server
    let (bridge, tools) = Bridge::connect(params, config.timeouts.bridge_options())
        .await
        .with_context(|| format!("Failed to start tool server '{}'", config.server.command))?;

    // Stream events until the run ends
    info!("Running query: {}", cli.query);
    let mut events = agent.run_and_close(bridge, tools, cli.query);
    let mut failure = None;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if let RunEvent::Failure { kind, message } = &event {
                    failure = Some(format!("{}: {}", kind, message));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                // returning drops the stream, which kills the server
                warn!("Interrupted, stopping tool server");
                anyhow::bail!("Interrupted");
            }
        }
    }

    if let Some(failure) = failure {
        error!("Run failed: {}", failure);
        anyhow::bail!("Run failed: {}", failure);
    }

    Ok(())
}

fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    // stdout carries the event stream
    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}

fn print_banner(config: &config::AppConfig) {
    info!("toolbridge v{}", env!("CARGO_PKG_VERSION"));
    info!("  → Tool server: {} {}", config.server.command, config.server.args.join(" "));
    info!("  → Agent: {} ({})", config.agent.name, config.agent.model);
    info!(
        "  → Steps: {}, concurrent calls: {}",
        config.agent.max_steps, config.agent.max_concurrent_calls
    );
    info!("  → Log: {} / {}", config.logging.level, config.logging.format);
}
