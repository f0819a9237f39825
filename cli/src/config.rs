// Endpoint configuration management for the peerstore CLI
//
// Each configured endpoint lives in its own directory:
//   <home>/endpoints/<name>/config.json   settings
//   <home>/endpoints/<name>/store/        sled object store
//   <home>/endpoints/<name>/spill/        scratch tier of a memory-capped store
//   <home>/endpoints/<name>/log.txt       log of `endpoint start`
//
// <home> is --home, then $PEERSTORE_HOME, then <config dir>/peerstore.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use peerstore_core::identity::validate_name;
use peerstore_core::{EndpointConfig, EndpointId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Default port of the local HTTP API
pub const DEFAULT_API_PORT: u16 = 8780;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSettings {
    /// Settings handed to the core endpoint
    pub endpoint: EndpointConfig,
    /// Local HTTP API port (127.0.0.1 only)
    pub api_port: u16,
    /// Keep objects in memory instead of the endpoint's sled directory
    #[serde(default)]
    pub in_memory: bool,
    /// Bytes an in-memory store keeps resident before spilling to disk
    #[serde(default)]
    pub max_memory: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl EndpointSettings {
    /// Fresh settings with a newly minted endpoint id
    pub fn new(name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            endpoint: EndpointConfig {
                endpoint_id: Some(EndpointId::generate()),
                ..EndpointConfig::new(name)
            },
            api_port: DEFAULT_API_PORT,
            in_memory: false,
            max_memory: None,
            created_at: Utc::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    /// Core config with storage paths resolved against the endpoint directory
    pub fn runtime_config(&self, endpoint_dir: &Path) -> EndpointConfig {
        let mut config = self.endpoint.clone();
        if !self.in_memory {
            if config.storage_path.is_none() {
                config.storage_path = Some(endpoint_dir.join("store"));
            }
        } else if let Some(max_memory) = self.max_memory {
            config.max_memory = Some(max_memory);
            config.spill_path = Some(endpoint_dir.join("spill"));
        }
        config
    }

    /// Set one field by its command-line name
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let endpoint = &mut self.endpoint;
        match key {
            "relay" => {
                endpoint.relay_address = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "listen" => {
                endpoint.listen_address = value.parse().context("Invalid listen address")?;
            }
            "advertise" => {
                endpoint.advertised_addresses = value
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.trim().parse::<SocketAddr>().context("Invalid advertised address"))
                    .collect::<Result<_>>()?;
            }
            "credentials" => {
                endpoint.credentials = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "api_port" => {
                self.api_port = value.parse().context("Invalid port number")?;
                anyhow::ensure!(self.api_port > 0, "API port must be non-zero");
            }
            "max_object_size" => {
                endpoint.max_object_size = value.parse().context("Invalid size")?;
            }
            "request_timeout_ms" => {
                endpoint.request_timeout_ms = value.parse().context("Invalid number")?;
            }
            "idle_timeout_secs" => {
                endpoint.idle_timeout_secs = value.parse().context("Invalid number")?;
            }
            "in_memory" => {
                self.in_memory = value.parse().context("Invalid boolean value")?;
            }
            "max_memory" => {
                self.max_memory = if value.is_empty() {
                    None
                } else {
                    let bytes: usize = value.parse().context("Invalid size")?;
                    anyhow::ensure!(bytes > 0, "max_memory must be non-zero");
                    Some(bytes)
                };
            }
            "max_concurrent_requests" => {
                endpoint.max_concurrent_requests = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        self.endpoint.validate()?;
        Ok(())
    }

    /// All values for display
    pub fn list(&self) -> Vec<(String, String)> {
        let endpoint = &self.endpoint;
        let advertised: Vec<String> = endpoint
            .advertised_addresses
            .iter()
            .map(|a| a.to_string())
            .collect();
        vec![
            (
                "endpoint_id".to_string(),
                endpoint
                    .endpoint_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "(generated at start)".to_string()),
            ),
            (
                "relay".to_string(),
                endpoint
                    .relay_address
                    .clone()
                    .unwrap_or_else(|| "(solo)".to_string()),
            ),
            ("listen".to_string(), endpoint.listen_address.to_string()),
            ("advertise".to_string(), advertised.join(",")),
            (
                "credentials".to_string(),
                if endpoint.credentials.is_some() { "(set)" } else { "(none)" }.to_string(),
            ),
            ("api_port".to_string(), self.api_port.to_string()),
            ("max_object_size".to_string(), endpoint.max_object_size.to_string()),
            (
                "request_timeout_ms".to_string(),
                endpoint.request_timeout_ms.to_string(),
            ),
            (
                "idle_timeout_secs".to_string(),
                endpoint.idle_timeout_secs.to_string(),
            ),
            ("in_memory".to_string(), self.in_memory.to_string()),
            (
                "max_memory".to_string(),
                self.max_memory
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "(unbounded)".to_string()),
            ),
            (
                "max_concurrent_requests".to_string(),
                endpoint.max_concurrent_requests.to_string(),
            ),
            (
                "created_at".to_string(),
                self.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            ),
        ]
    }
}

/// Directory layout rooted at the CLI home
#[derive(Debug, Clone)]
pub struct Home {
    root: PathBuf,
}

impl Home {
    /// Resolve the home directory; `explicit` comes from --home / $PEERSTORE_HOME
    pub fn resolve(explicit: Option<PathBuf>) -> Result<Self> {
        let root = match explicit {
            Some(root) => root,
            None => dirs::config_dir()
                .context("Failed to determine config directory")?
                .join("peerstore"),
        };
        Ok(Self { root })
    }

    fn endpoints_dir(&self) -> PathBuf {
        self.root.join("endpoints")
    }

    pub fn endpoint_dir(&self, name: &str) -> PathBuf {
        self.endpoints_dir().join(name)
    }

    fn config_file(&self, name: &str) -> PathBuf {
        self.endpoint_dir(name).join("config.json")
    }

    pub fn exists(&self, name: &str) -> bool {
        self.config_file(name).exists()
    }

    pub fn load(&self, name: &str) -> Result<EndpointSettings> {
        validate_name(name)?;
        let path = self.config_file(name);
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Endpoint {:?} is not configured", name))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, settings: &EndpointSettings) -> Result<()> {
        let dir = self.endpoint_dir(settings.name());
        std::fs::create_dir_all(&dir).context("Failed to create endpoint directory")?;
        let contents =
            serde_json::to_string_pretty(settings).context("Failed to serialize config")?;
        std::fs::write(self.config_file(settings.name()), contents)
            .context("Failed to write config file")?;
        Ok(())
    }

    /// Names of all configured endpoints, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.endpoints_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir).context("Failed to read endpoints directory")? {
            let entry = entry?;
            if entry.path().join("config.json").exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete the endpoint directory, including its stored objects
    pub fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        anyhow::ensure!(self.exists(name), "Endpoint {:?} is not configured", name);
        std::fs::remove_dir_all(self.endpoint_dir(name))
            .context("Failed to remove endpoint directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let home = Home::resolve(Some(dir.path().to_path_buf())).unwrap();
        assert!(home.list().unwrap().is_empty());

        let mut settings = EndpointSettings::new("alpha").unwrap();
        settings.set("relay", "127.0.0.1:8700").unwrap();
        home.save(&settings).unwrap();
        home.save(&EndpointSettings::new("beta").unwrap()).unwrap();

        assert_eq!(home.list().unwrap(), vec!["alpha", "beta"]);
        assert_eq!(home.load("alpha").unwrap(), settings);

        home.remove("alpha").unwrap();
        assert_eq!(home.list().unwrap(), vec!["beta"]);
        assert!(home.load("alpha").is_err());
    }

    #[test]
    fn test_set_validates() {
        let mut settings = EndpointSettings::new("alpha").unwrap();
        assert!(settings.set("relay", "no-port").is_err());
        assert!(settings.set("max_object_size", "0").is_err());
        assert!(settings.set("listen", "127.0.0.1:9000").is_ok());
        assert!(settings.set("advertise", "203.0.113.5:9000,198.51.100.1:9000").is_ok());
        assert_eq!(settings.endpoint.advertised_addresses.len(), 2);
        assert!(settings.set("bogus", "1").is_err());
    }

    #[test]
    fn test_runtime_config_uses_endpoint_store() {
        let mut settings = EndpointSettings::new("alpha").unwrap();
        let dir = Path::new("/tmp/peerstore-test/alpha");
        assert_eq!(
            settings.runtime_config(dir).storage_path,
            Some(dir.join("store"))
        );
        settings.in_memory = true;
        assert_eq!(settings.runtime_config(dir).storage_path, None);
        assert_eq!(settings.runtime_config(dir).spill_path, None);
    }

    #[test]
    fn test_memory_cap_spills_into_endpoint_dir() {
        let mut settings = EndpointSettings::new("alpha").unwrap();
        settings.set("in_memory", "true").unwrap();
        settings.set("max_memory", "4096").unwrap();
        assert!(settings.set("max_memory", "0").is_err());
        let dir = Path::new("/tmp/peerstore-test/alpha");
        let config = settings.runtime_config(dir);
        assert_eq!(config.max_memory, Some(4096));
        assert_eq!(config.spill_path, Some(dir.join("spill")));
        assert!(config.validate().is_ok());

        // A sled-backed endpoint ignores the cap
        settings.set("in_memory", "false").unwrap();
        let config = settings.runtime_config(dir);
        assert_eq!(config.max_memory, None);
        assert!(config.validate().is_ok());

        settings.set("max_memory", "").unwrap();
        assert_eq!(settings.max_memory, None);
        assert!(settings.set("max_concurrent_requests", "0").is_err());
    }

    #[test]
    fn test_bad_names_rejected() {
        assert!(EndpointSettings::new("../escape").is_err());
        assert!(EndpointSettings::new("").is_err());
    }
}
