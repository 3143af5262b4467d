//! Connector configuration: the TOML-described binding of one
//! `(relay_id, shared_folder_id)` pair to a Git remote. Loading and
//! validating this is in scope even though a CLI wrapper around it is
//! not — the uniqueness and URL-shape invariants are testable properties
//! in their own right (§8).

use serde::Deserialize;

use crate::error::SyncError;
use crate::resource::is_uuid;

fn default_branch() -> String {
    "main".to_string()
}

fn default_remote_name() -> String {
    "origin".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Connector {
    pub relay_id: String,
    pub shared_folder_id: String,
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_remote_name")]
    pub remote_name: String,
    #[serde(default)]
    pub prefix: String,
}

const VALID_URL_PREFIXES: &[&str] = &["http://", "https://", "git@", "ssh://"];

impl Connector {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.relay_id.is_empty() || self.shared_folder_id.is_empty() || self.url.is_empty() {
            return Err(SyncError::ConfigError {
                detail: "connector requires non-empty relay_id, shared_folder_id, and url".into(),
            });
        }
        if !is_uuid(&self.relay_id) {
            return Err(SyncError::ConfigError {
                detail: format!("relay_id is not a well-formed uuid: {}", self.relay_id),
            });
        }
        if !is_uuid(&self.shared_folder_id) {
            return Err(SyncError::ConfigError {
                detail: format!(
                    "shared_folder_id is not a well-formed uuid: {}",
                    self.shared_folder_id
                ),
            });
        }
        if !VALID_URL_PREFIXES.iter().any(|p| self.url.starts_with(p)) {
            return Err(SyncError::ConfigError {
                detail: format!(
                    "url must start with one of {:?}, got: {}",
                    VALID_URL_PREFIXES, self.url
                ),
            });
        }
        if self.prefix.contains("..") {
            return Err(SyncError::ConfigError {
                detail: format!("prefix must not contain '..': {}", self.prefix),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default, rename = "git_connector")]
    git_connector: Vec<Connector>,
}

/// A validated, deduplicated collection of connectors loaded from TOML.
#[derive(Debug, Default)]
pub struct ConnectorConfig {
    pub connectors: Vec<Connector>,
}

impl ConnectorConfig {
    /// Parses `toml_str`, validating each connector individually. An
    /// invalid connector is dropped with a logged warning rather than
    /// failing the whole load — other connectors still continue, per the
    /// §7 ConfigError policy.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, SyncError> {
        let raw: RawConfig = toml::from_str(toml_str).map_err(|e| SyncError::ConfigError {
            detail: e.to_string(),
        })?;

        let mut accepted: Vec<Connector> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for connector in raw.git_connector {
            if let Err(e) = connector.validate() {
                tracing::warn!("dropping invalid connector: {e}");
                continue;
            }
            let key = (connector.relay_id.clone(), connector.shared_folder_id.clone());
            if !seen.insert(key.clone()) {
                tracing::warn!(
                    "dropping duplicate connector for relay {} folder {}",
                    key.0,
                    key.1
                );
                continue;
            }
            accepted.push(connector);
        }

        Ok(ConnectorConfig {
            connectors: accepted,
        })
    }

    pub fn get_connector_for_folder(&self, relay_id: &str, folder_id: &str) -> Option<&Connector> {
        self.connectors
            .iter()
            .find(|c| c.relay_id == relay_id && c.shared_folder_id == folder_id)
    }

    pub fn get_connectors_for_relay(&self, relay_id: &str) -> Vec<&Connector> {
        self.connectors
            .iter()
            .filter(|c| c.relay_id == relay_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELAY_A: &str = "550e8400-e29b-41d4-a716-446655440000";
    const RELAY_B: &str = "660e8400-e29b-41d4-a716-446655440001";
    const FOLDER_A: &str = "770e8400-e29b-41d4-a716-446655440002";

    #[test]
    fn loads_well_formed_multi_entry_file() {
        let toml_str = format!(
            r#"
            [[git_connector]]
            relay_id = "{RELAY_A}"
            shared_folder_id = "{FOLDER_A}"
            url = "git@github.com:acme/repo.git"

            [[git_connector]]
            relay_id = "{RELAY_B}"
            shared_folder_id = "{FOLDER_A}"
            url = "https://github.com/acme/other.git"
            branch = "trunk"
            "#
        );
        let config = ConnectorConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(config.connectors.len(), 2);
        assert_eq!(
            config
                .get_connector_for_folder(RELAY_B, FOLDER_A)
                .unwrap()
                .branch,
            "trunk"
        );
    }

    #[test]
    fn rejects_duplicate_relay_folder_pair() {
        let toml_str = format!(
            r#"
            [[git_connector]]
            relay_id = "{RELAY_A}"
            shared_folder_id = "{FOLDER_A}"
            url = "git@github.com:acme/repo.git"

            [[git_connector]]
            relay_id = "{RELAY_A}"
            shared_folder_id = "{FOLDER_A}"
            url = "git@github.com:acme/repo-2.git"
            "#
        );
        let config = ConnectorConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(config.connectors.len(), 1);
    }

    #[test]
    fn rejects_bad_url_prefix() {
        let toml_str = format!(
            r#"
            [[git_connector]]
            relay_id = "{RELAY_A}"
            shared_folder_id = "{FOLDER_A}"
            url = "ftp://nope"
            "#
        );
        let config = ConnectorConfig::from_toml_str(&toml_str).unwrap();
        assert!(config.connectors.is_empty());
    }
}
