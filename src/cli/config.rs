use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Configuration loaded from `botflow.yaml`.
/// All fields are optional — missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BotflowConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub store_dir: Option<String>,
    pub max_body: Option<usize>,
    /// Base URL of the messaging platform, e.g. the bot API endpoint.
    pub messenger_url: Option<String>,
    /// Base URL of the data-layer service.
    pub gateway_url: Option<String>,
    /// Outbound HTTP timeout for both collaborators, in milliseconds.
    pub client_timeout_ms: Option<u64>,
}

impl BotflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `botflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("botflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: BotflowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_default_config_yields_defaults() {
        let config = BotflowConfig::load(None).unwrap();
        assert!(config.port.is_none());
    }

    #[test]
    fn explicit_missing_path_errors() {
        assert!(BotflowConfig::load(Some(Path::new("/nonexistent/botflow.yaml"))).is_err());
    }

    #[test]
    fn parses_yaml_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port: 8080\nmessenger_url: https://bots.example.com").unwrap();
        let config = BotflowConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, Some(8080));
        assert_eq!(
            config.messenger_url.as_deref(),
            Some("https://bots.example.com")
        );
    }
}
