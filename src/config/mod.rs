// Configuration management module
// TOML settings for every pipeline stage plus the interactive editor

pub mod interactive;
pub mod settings;


pub use interactive::{run_interactive_config, show_config};
pub use settings::{CONFIG_DIR_ENV, Config, ConfigError, OllamaConfig};

/// Get the configuration directory path, honouring an explicit override
#[inline]
pub fn get_config_dir(
    explicit: Option<&std::path::Path>,
) -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir(explicit)
}
