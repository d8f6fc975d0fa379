use clap::{Parser, Subcommand};
use safe_recall::Result;
use safe_recall::commands::{ask, chat, ingest_files, show_health};
use safe_recall::config::{Config, get_config_dir, run_interactive_config, show_config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "safe-recall")]
#[command(about = "Retrieval-grounded replies with hallucination and crisis checks")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml (overrides SAFE_RECALL_CONFIG_DIR)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure Ollama, retrieval and verification settings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Chunk and embed files, then print store statistics
    Ingest {
        /// Text or markdown files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Collection to ingest into instead of the configured one
        #[arg(long)]
        collection: Option<String>,
    },
    /// Run one turn through the pipeline
    Ask {
        /// The user message
        message: String,
        /// Files loaded into the knowledge collection first
        #[arg(long, num_args = 1..)]
        knowledge: Vec<PathBuf>,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read messages from stdin and reply to each, keeping history
    Chat {
        /// Files loaded into the knowledge collection first
        #[arg(long, num_args = 1..)]
        knowledge: Vec<PathBuf>,
    },
    /// Probe every pipeline stage
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = get_config_dir(cli.config_dir.as_deref())
        .map_err(|e| safe_recall::RecallError::Config(e.to_string()))?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config_dir)?;
            } else {
                run_interactive_config(&config_dir)?;
            }
        }
        Commands::Ingest { files, collection } => {
            ingest_files(Config::load(&config_dir)?, &files, collection).await?;
        }
        Commands::Ask {
            message,
            knowledge,
            json,
        } => {
            ask(&Config::load(&config_dir)?, &message, &knowledge, json).await?;
        }
        Commands::Chat { knowledge } => {
            chat(&Config::load(&config_dir)?, &knowledge).await?;
        }
        Commands::Health => {
            show_health(&Config::load(&config_dir)?).await?;
        }
    }

    Ok(())
}
