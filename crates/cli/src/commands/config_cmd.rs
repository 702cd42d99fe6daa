//! `parley config`: Configuration inspection.

use std::path::Path;

use parley_config::AppConfig;

/// Load the config from `path` (or the default location) and print it.
pub fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(path)?;
    if let Some(path) = path {
        eprintln!("# {} is valid", path.display());
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn starter() {
    println!("{}", AppConfig::default_toml());
}

/// `load_from` for an explicit file, `load` (with env overrides) otherwise.
pub fn load(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?,
    };
    Ok(config)
}
