
use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};
use std::path::Path;

use super::{Config, ConfigError, OllamaConfig};

#[inline]
pub fn run_interactive_config(config_dir: &Path) -> Result<()> {
    eprintln!("{}", style("🔧 Safe Recall Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config(config_dir)?;

    eprintln!("{}", style("Ollama Configuration").bold().yellow());
    eprintln!("Configure the Ollama instance used for embeddings.");
    eprintln!("When disabled, a local hashing embedder is used instead.");
    eprintln!();

    configure_ollama(&mut config.ollama)?;

    if config.ollama.enabled {
        eprintln!();
        eprintln!("{}", style("Testing configuration...").yellow());

        if test_ollama_connection(&config.ollama) {
            eprintln!("{}", style("✓ Ollama connection successful!").green());
        } else {
            eprintln!(
                "{}",
                style("⚠ Warning: Could not connect to Ollama").yellow()
            );
            eprintln!("Replies will use the fallback embedder until Ollama is reachable.");
        }
    }

    eprintln!();
    eprintln!("{}", style("Retrieval and Verification").bold().yellow());
    configure_retrieval(&mut config)?;

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());

    let mut current_section = "";
    for (section, key, value) in config_summary(&config) {
        if section != current_section {
            eprintln!();
            eprintln!("{}", style(format!("{}:", section)).bold().yellow());
            current_section = section;
        }
        eprintln!("  {}: {}", key, style(value).cyan());
    }

    eprintln!();
    match config.ollama_url() {
        Ok(url) => eprintln!("  Ollama URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  Ollama URL: {} ({})", style("Invalid").red(), e),
    }

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}

/// Rows shown by `config --show`, grouped by section
fn config_summary(config: &Config) -> Vec<(&'static str, &'static str, String)> {
    let ollama = &config.ollama;
    let retrieval = &config.retrieval;
    let rerank = &config.rerank;
    let guard = &config.guard;
    let pipeline = &config.pipeline;

    vec![
        ("Ollama Settings", "Enabled", ollama.enabled.to_string()),
        ("Ollama Settings", "Host", ollama.host.clone()),
        ("Ollama Settings", "Port", ollama.port.to_string()),
        ("Ollama Settings", "Model", ollama.model.clone()),
        ("Ollama Settings", "Batch Size", ollama.batch_size.to_string()),
        (
            "Ollama Settings",
            "Embedding Dimension",
            ollama.embedding_dimension.to_string(),
        ),
        (
            "Chunking",
            "Target Chunk Chars",
            config.chunking.target_chunk_chars.to_string(),
        ),
        (
            "Chunking",
            "Overlap Chars",
            config.chunking.overlap_chars.to_string(),
        ),
        ("Retrieval", "Collection", retrieval.collection.clone()),
        ("Retrieval", "Relevance Floor", retrieval.relevance_floor.to_string()),
        ("Retrieval", "Max Results", retrieval.max_results.to_string()),
        ("Rerank", "Top K", rerank.top_k.to_string()),
        ("Rerank", "Score Threshold", rerank.score_threshold.to_string()),
        ("Rerank", "Context Window", rerank.context_window.to_string()),
        (
            "Guard",
            "Unverified Claims Check",
            guard.unverified_claims.to_string(),
        ),
        (
            "Guard",
            "Claim Similarity Threshold",
            guard.claim_similarity_threshold.to_string(),
        ),
        ("Pipeline", "History Window", pipeline.history_window.to_string()),
    ]
}

fn load_existing_config(config_dir: &Path) -> Result<Config> {
    if config_dir.join("config.toml").exists() {
        let config = Config::load(config_dir)?;
        eprintln!("{}", style("Found existing configuration.").green());
        Ok(config)
    } else {
        eprintln!(
            "{}",
            style("No existing configuration found. Using defaults.").yellow()
        );
        Ok(Config {
            base_dir: config_dir.to_path_buf(),
            ..Config::default()
        })
    }
}

fn configure_ollama(ollama: &mut OllamaConfig) -> Result<()> {
    ollama.enabled = Confirm::new()
        .with_prompt("Use Ollama for embeddings?")
        .default(ollama.enabled)
        .interact()?;

    if !ollama.enabled {
        return Ok(());
    }

    let protocols = &["http", "https"];
    let default_index = protocols
        .iter()
        .position(|&p| p == ollama.protocol)
        .unwrap_or(0);

    let protocol_index = Select::new()
        .with_prompt("Ollama protocol")
        .default(default_index)
        .items(protocols)
        .interact()?;

    let protocol = protocols[protocol_index].to_string();

    let host: String = Input::new()
        .with_prompt("Ollama host")
        .default(ollama.host.clone())
        .validate_with(|input: &String| -> Result<(), ConfigError> {
            let temp_config = OllamaConfig {
                protocol: protocol.clone(),
                host: input.clone(),
                ..OllamaConfig::default()
            };
            temp_config.ollama_url().map(|_| ())
        })
        .interact_text()?;

    let port: u16 = Input::new()
        .with_prompt("Ollama port")
        .default(ollama.port)
        .validate_with(|input: &u16| -> Result<(), &str> {
            if *input == 0 {
                Err("Port must be greater than 0")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let model: String = Input::new()
        .with_prompt("Embedding model")
        .default(ollama.model.clone())
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Model name cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let batch_size: u32 = Input::new()
        .with_prompt("Batch size for embedding generation")
        .default(ollama.batch_size)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if *input == 0 {
                Err("Batch size must be greater than 0")
            } else if *input > 1000 {
                Err("Batch size must be 1000 or less")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    let dimension: u32 = Input::new()
        .with_prompt("Embedding dimension")
        .default(ollama.embedding_dimension)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if (64..=4096).contains(input) {
                Ok(())
            } else {
                Err("Dimension must be between 64 and 4096")
            }
        })
        .interact_text()?;

    ollama.set_protocol(protocol)?;
    ollama.set_host(host)?;
    ollama.set_port(port)?;
    ollama.set_model(model)?;
    ollama.set_batch_size(batch_size)?;
    ollama.set_embedding_dimension(dimension)?;

    Ok(())
}

fn configure_retrieval(config: &mut Config) -> Result<()> {
    config.retrieval.max_results = Input::new()
        .with_prompt("Knowledge results per reply")
        .default(config.retrieval.max_results)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if *input == 0 {
                Err("At least one result is required")
            } else {
                Ok(())
            }
        })
        .interact_text()?;

    config.retrieval.relevance_floor = Input::new()
        .with_prompt("Relevance floor (0-1)")
        .default(config.retrieval.relevance_floor)
        .validate_with(|input: &f32| -> Result<(), &str> {
            if (0.0..=1.0).contains(input) {
                Ok(())
            } else {
                Err("Relevance floor must be between 0 and 1")
            }
        })
        .interact_text()?;

    config.guard.unverified_claims = Confirm::new()
        .with_prompt("Check reply sentences against the knowledge base?")
        .default(config.guard.unverified_claims)
        .interact()?;

    Ok(())
}

fn test_ollama_connection(ollama: &OllamaConfig) -> bool {
    let url = format!(
        "{}://{}:{}/api/version",
        ollama.protocol, ollama.host, ollama.port
    );

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    match agent.get(&url).call() {
        Ok(_) => true,
        Err(ureq::Error::StatusCode(code)) if (400..500).contains(&code) => true,
        Err(_) => false,
    }
}
