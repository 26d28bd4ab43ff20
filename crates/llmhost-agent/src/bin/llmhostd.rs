//! Main binary for the llmhost daemon (llmhostd)

use anyhow::Context;
use clap::{Parser, Subcommand};
use llmhost_agent::{default_config, init_logging, load_config, AgentBuilder, ConfigOverrides};
use llmhost_core::NodeConfig;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "llmhostd")]
#[command(about = "On-demand model process scheduler with an OpenAI-compatible router")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration file
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Address to bind
    #[arg(long, value_name = "HOST", global = true)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, value_name = "PORT", global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Run,
    /// Print a default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate the file given with --config and print its models
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { ref output }) => generate_config(output.clone()),
        Some(Commands::Validate) => {
            let path = cli
                .config
                .clone()
                .context("validate needs a configuration file (--config FILE)")?;
            validate_config(path)
        }
        Some(Commands::Run) | None => run(&cli).await,
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        log_level: cli.log_level.clone(),
        host: cli.host.clone(),
        port: cli.port,
    };
    let config = load_config(cli.config.as_deref(), &overrides)
        .context("failed to load configuration")?;

    init_logging(&config.logging)?;
    info!(
        "Loaded {} model(s), listening on {}:{}",
        config.models.len(),
        config.server.host,
        config.server.port
    );

    let agent = AgentBuilder::new().with_config(config).build()?;

    if let Err(e) = agent.run().await {
        error!("Agent failed: {}", e);
        return Err(e.into());
    }

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> anyhow::Result<()> {
    let yaml = default_config().to_yaml()?;

    if let Some(output) = output {
        std::fs::write(&output, yaml)
            .with_context(|| format!("failed to write {}", output.display()))?;
        println!("Configuration written to: {}", output.display());
    } else {
        println!("{}", yaml);
    }

    Ok(())
}

fn validate_config(path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = match NodeConfig::load(Some(&path)) {
        Ok(config) => config,
        Err(e) => {
            println!("✗ Configuration is invalid: {}", e);
            std::process::exit(1);
        }
    };

    println!("✓ Configuration is valid");
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Models:");
    for model in &config.models {
        println!(
            "    - {} ({}, port {}{})",
            model.aliases.join(", "),
            model.mode,
            model.port,
            if model.auto_start { ", auto-start" } else { "" }
        );
        for hardware in &model.hardware {
            println!(
                "        {}: {} -> {}",
                hardware.name,
                hardware.device_list(),
                hardware.script.display()
            );
        }
    }

    Ok(())
}
