//! Configuration management for portrack.
//!
//! This module defines the structure of the optional `portrack.toml` settings
//! file and provides functionality to load and parse it. The project catalog
//! itself lives in a separate JSON document (see `catalog`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration structure corresponding to `portrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Address the HTTP API binds to.
    pub bind: Option<String>,
    /// Port the HTTP API listens on.
    pub port: Option<u16>,
    /// Path of the JSON project catalog.
    pub catalog: Option<PathBuf>,
    /// Directory holding `index.html`.
    pub static_dir: Option<PathBuf>,
    /// Connect timeout for port probes, in milliseconds.
    pub probe_timeout_ms: Option<u64>,
    /// Registration endpoint used by `portrack register`.
    pub api_url: Option<String>,
}

impl Config {
    // Relative paths in the file are relative to the file, not the cwd.
    fn resolve_paths(mut self, base: &Path) -> Self {
        self.catalog = self.catalog.map(|p| base.join(p));
        self.static_dir = self.static_dir.map(|p| base.join(p));
        self
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    Ok(config.resolve_paths(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
bind = "0.0.0.0"
port = 6000
catalog = "data/config.json"
static_dir = "static"
probe_timeout_ms = 150
api_url = "http://127.0.0.1:6000/projects"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.bind.as_deref(), Some("0.0.0.0"));
        assert_eq!(config.port, Some(6000));
        assert_eq!(config.catalog, Some(PathBuf::from("data/config.json")));
        assert_eq!(config.probe_timeout_ms, Some(150));
        assert_eq!(config.api_url.as_deref(), Some("http://127.0.0.1:6000/projects"));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.bind.is_none());
        assert!(config.catalog.is_none());
    }

    #[test]
    fn paths_resolve_against_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portrack.toml");
        std::fs::write(&path, "catalog = \"config.json\"\nstatic_dir = \"web\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.catalog, Some(dir.path().join("config.json")));
        assert_eq!(config.static_dir, Some(dir.path().join("web")));
    }
}
