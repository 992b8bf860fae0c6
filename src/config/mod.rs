use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File error: {0}")]
    File(#[from] std::io::Error),
    #[error("Yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// Interception configuration. `enabled: false` turns the engine into a pure
/// pass-through without tearing anything down.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Relay endpoints captured connections are redirected toward.
    #[serde(default)]
    pub servers: Vec<SocketAddr>,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: Vec::new(),
        }
    }
}

pub fn load_forward_config(path: &Path) -> Result<ForwardConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let cfg: ForwardConfig = serde_yaml::from_str(
            r#"
enabled: true
servers:
  - 10.0.0.5:8443
  - 10.0.0.6:8443
"#,
        )
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.servers.len(), 2);
        assert_eq!(cfg.servers[0], "10.0.0.5:8443".parse().unwrap());
    }

    #[test]
    fn test_defaults() {
        let cfg: ForwardConfig = serde_yaml::from_str("{}").unwrap();
        assert!(cfg.enabled);
        assert!(cfg.servers.is_empty());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(serde_yaml::from_str::<ForwardConfig>("bogus: 1").is_err());
    }
}
