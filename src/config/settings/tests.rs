use super::*;
use serial_test::serial;
use tempfile::TempDir;

#[test]
fn default_config() {
    let config = Config::default();
    assert_eq!(config.ollama.protocol, "http");
    assert_eq!(config.ollama.host, "localhost");
    assert_eq!(config.ollama.port, 11434);
    assert_eq!(config.ollama.model, "nomic-embed-text:latest");
    assert_eq!(config.ollama.batch_size, 16);
    assert_eq!(config.ollama.embedding_dimension, 768);
    assert!(config.ollama.enabled);
    assert_eq!(config.chunking.target_chunk_chars, 512);
    assert_eq!(config.retrieval.collection, "knowledge");
    assert!((config.retrieval.relevance_floor - 0.5).abs() < f32::EPSILON);
    assert_eq!(config.rerank.context_window, 5);
    assert!(!config.guard.unverified_claims);
    assert_eq!(config.pipeline.history_window, 10);
    assert!(config.validate().is_ok());
}

#[test]
fn config_validation() {
    let config = Config::default();

    let mut invalid_config = config.clone();
    invalid_config.ollama.protocol = "ftp".to_string();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.port = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.model = String::new();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.batch_size = 1001;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.ollama.timeout_secs = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.chunking.overlap_chars = invalid_config.chunking.target_chunk_chars;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::OverlapTooLarge(512, 512))
    ));

    let mut invalid_config = config.clone();
    invalid_config.retrieval.relevance_floor = 1.5;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::OutOfUnitRange {
            name: "relevance_floor",
            ..
        })
    ));

    let mut invalid_config = config.clone();
    invalid_config.rerank.top_k = 0;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::ZeroValue("top_k"))
    ));

    let mut invalid_config = config;
    invalid_config.guard.knowledge_collection = "  ".to_string();
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::EmptyCollection)
    ));
}

#[test]
fn ollama_url_generation() {
    let config = Config::default();
    let url = config
        .ollama_url()
        .expect("should generate ollama_url successfully");
    assert_eq!(url.as_str(), "http://localhost:11434/");

    let mut config = Config::default();
    config.ollama.protocol = "https".to_string();
    config.ollama.host = "secure.example.com".to_string();
    config.ollama.port = 443;
    let url = config
        .ollama_url()
        .expect("should generate https url successfully");
    assert_eq!(url.as_str(), "https://secure.example.com/");
}

#[test]
fn toml_serialization() {
    let mut config = Config::default();
    config.ollama.enabled = false;
    config.guard.unverified_claims = true;
    config.retrieval.max_results = 8;

    let toml_str = toml::to_string(&config).expect("should serialize toml correctly");
    let parsed_config: Config = toml::from_str(&toml_str).expect("should parse toml correctly");
    assert_eq!(config, parsed_config);
}

#[test]
fn partial_toml_uses_defaults() {
    let toml_str = r#"
        [ollama]
        host = "gpu-box"
        enabled = false

        [retrieval]
        max_results = 3
    "#;

    let config: Config = toml::from_str(toml_str).expect("should parse partial toml");
    assert_eq!(config.ollama.host, "gpu-box");
    assert_eq!(config.ollama.port, 11434);
    assert!(!config.ollama.enabled);
    assert_eq!(config.retrieval.max_results, 3);
    assert_eq!(config.retrieval.history_turns, 2);
    assert_eq!(config.rerank, RerankConfig::default());
    assert_eq!(config.pipeline, PipelineConfig::default());
}

#[test]
fn setter_validation() {
    let mut config = OllamaConfig {
        model: "test-model".to_string(),
        batch_size: 32,
        ..OllamaConfig::default()
    };

    assert!(config.set_protocol("https".to_string()).is_ok());
    assert!(config.set_host("example.com".to_string()).is_ok());
    assert!(config.set_port(8080).is_ok());
    assert!(config.set_model("new-model".to_string()).is_ok());
    assert!(config.set_batch_size(128).is_ok());
    assert!(config.set_embedding_dimension(384).is_ok());

    assert!(config.set_protocol("ftp".to_string()).is_err());
    assert!(config.set_protocol("HTTP".to_string()).is_err());
    assert!(config.set_port(0).is_err());
    assert!(config.set_model(String::new()).is_err());
    assert!(config.set_batch_size(0).is_err());
    assert!(config.set_batch_size(1001).is_err());
    assert!(config.set_embedding_dimension(32).is_err());

    assert_eq!(config.protocol, "https");
    assert_eq!(config.batch_size, 128);
    assert_eq!(config.embedding_dimension, 384);
}

#[test]
fn load_missing_config_returns_defaults() {
    let temp_dir = TempDir::new().expect("should create temp dir");

    let config = Config::load(temp_dir.path()).expect("missing file should load defaults");
    assert_eq!(config.ollama, OllamaConfig::default());
    assert_eq!(config.get_base_dir(), temp_dir.path());
    assert_eq!(
        config.config_file_path(),
        temp_dir.path().join("config.toml")
    );
}

#[test]
fn save_then_load() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config_dir = temp_dir.path().join("nested").join("safe-recall");

    let mut config = Config::load(&config_dir).expect("should load defaults");
    config.ollama.model = "mxbai-embed-large".to_string();
    config.guard.crisis_lookback_turns = 3;
    config.save().expect("should save config");

    assert!(config_dir.join("config.toml").exists());

    let loaded = Config::load(&config_dir).expect("should load saved config");
    assert_eq!(loaded, config);
}

#[test]
fn save_rejects_invalid_config() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = Config::load(temp_dir.path()).expect("should load defaults");
    config.ollama.batch_size = 0;

    assert!(config.save().is_err());
    assert!(!temp_dir.path().join("config.toml").exists());
}

#[test]
fn load_rejects_invalid_file() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    fs::write(
        temp_dir.path().join("config.toml"),
        "[ollama]\nprotocol = \"gopher\"\n",
    )
    .expect("should write config");

    assert!(Config::load(temp_dir.path()).is_err());
}

#[test]
fn explicit_config_dir_wins() {
    let dir = resolve_config_dir(
        Some(Path::new("/tmp/explicit")),
        Some(OsString::from("/tmp/from-env")),
    )
    .expect("should resolve");
    assert_eq!(dir, PathBuf::from("/tmp/explicit"));

    let dir = resolve_config_dir(None, Some(OsString::from("/tmp/from-env")))
        .expect("should resolve");
    assert_eq!(dir, PathBuf::from("/tmp/from-env"));
}

#[test]
fn empty_env_value_is_ignored() {
    if let Some(platform_dir) = dirs::config_dir() {
        let dir = resolve_config_dir(None, Some(OsString::new())).expect("should resolve");
        assert_eq!(dir, platform_dir.join("safe-recall"));
    }
}

#[test]
#[serial]
fn config_dir_reads_environment() {
    let temp_dir = TempDir::new().expect("should create temp dir");

    // SAFETY: serialized with every other test that touches the environment
    unsafe { std::env::set_var(CONFIG_DIR_ENV, temp_dir.path()) };
    let resolved = Config::config_dir(None);
    // SAFETY: as above
    unsafe { std::env::remove_var(CONFIG_DIR_ENV) };

    assert_eq!(
        resolved.expect("should resolve from env"),
        temp_dir.path().to_path_buf()
    );
}
