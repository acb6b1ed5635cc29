use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ProxyConfig;

/// Load configuration from a file using the config crate
/// Supports multiple formats: TOML, YAML, JSON, etc.
pub async fn load_config(config_path: &str) -> Result<ProxyConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ProxyConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml, // Default to TOML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let proxy_config: ProxyConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(proxy_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::SelectionStrategy;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
addresses = ["127.0.0.1"]
ports = [80, 443]

[ssl]
ports = [443]
cert = "/etc/junction/cert.pem"
key = "/etc/junction/key.pem"

[store]
endpoint = "http://127.0.0.1:4001"
directory = "/routes"
watch_idle_secs = 30

[selection]
strategy = "weighted_random"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.addresses, vec!["127.0.0.1"]);
        assert_eq!(config.ports, vec![80, 443]);
        assert_eq!(config.ssl.as_ref().unwrap().ports, vec![443]);
        assert_eq!(config.store.directory, "/routes");
        assert_eq!(config.store.watch_idle_secs, 30);
        assert_eq!(
            config.selection.strategy,
            SelectionStrategy::WeightedRandom
        );
    }

    #[tokio::test]
    async fn test_load_json_config_with_defaults() {
        let json_content = r#"
{
  "ports": [8080],
  "store": {
    "endpoint": "http://etcd.internal:4001"
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.addresses, vec!["0.0.0.0"]);
        assert_eq!(config.store.endpoint, "http://etcd.internal:4001");
        assert_eq!(config.store.directory, "/junction");
        assert_eq!(config.selection.strategy, SelectionStrategy::IpHash);
        assert_eq!(config.shutdown.grace_secs, 10);
    }
}
