//! Server and database configuration.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default REST interface address.
pub const DEFAULT_INTERFACE: &str = ":4984";
/// Default admin interface address.
pub const DEFAULT_ADMIN_INTERFACE: &str = ":4985";
/// Default KV server URL.
pub const DEFAULT_SERVER: &str = "http://localhost:8091";
/// Default KV pool name.
pub const DEFAULT_POOL: &str = "default";

/// JSON object that defines the server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind the REST API to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Interface to bind the admin API to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_interface: Option<String>,
    /// Log keywords to enable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
    /// Pretty-print JSON responses?
    #[serde(default)]
    pub pretty: bool,
    /// The databases to serve.
    #[serde(default)]
    pub databases: Vec<DbConfig>,
}

/// One database's configuration within the [`ServerConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbConfig {
    /// Database name in the REST API.
    pub name: String,
    /// KV server URL; defaults to [`DEFAULT_SERVER`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Bucket name on the server; defaults to the database name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    /// KV pool name; defaults to [`DEFAULT_POOL`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
}

impl ServerConfig {
    /// Parses a config from JSON bytes and fills in defaults.
    ///
    /// # Errors
    ///
    /// Fails if the JSON is malformed or no databases are listed.
    pub fn from_json(data: &[u8]) -> CoreResult<Self> {
        let mut config: ServerConfig = serde_json::from_slice(data)
            .map_err(|e| CoreError::bad_request(format!("invalid config: {e}")))?;
        if config.databases.is_empty() {
            return Err(CoreError::bad_request("no databases listed"));
        }
        config.interface.get_or_insert_with(|| DEFAULT_INTERFACE.to_string());
        config
            .admin_interface
            .get_or_insert_with(|| DEFAULT_ADMIN_INTERFACE.to_string());
        for db in &mut config.databases {
            db.server.get_or_insert_with(|| DEFAULT_SERVER.to_string());
            db.bucket.get_or_insert_with(|| db.name.clone());
            db.pool.get_or_insert_with(|| DEFAULT_POOL.to_string());
        }
        Ok(config)
    }

    /// Reads a config from a JSON file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let data = std::fs::read(path).map_err(|e| {
            CoreError::bad_request(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_filled_in() {
        let config = ServerConfig::from_json(br#"{"databases": [{"name": "db"}]}"#).unwrap();
        assert_eq!(config.interface.as_deref(), Some(DEFAULT_INTERFACE));
        assert_eq!(config.admin_interface.as_deref(), Some(DEFAULT_ADMIN_INTERFACE));

        let db = &config.databases[0];
        assert_eq!(db.server.as_deref(), Some(DEFAULT_SERVER));
        assert_eq!(db.bucket.as_deref(), Some("db"));
        assert_eq!(db.pool.as_deref(), Some(DEFAULT_POOL));
    }

    #[test]
    fn explicit_values_survive() {
        let config = ServerConfig::from_json(
            br#"{"interface": ":8080",
                 "databases": [{"name": "db", "bucket": "other", "pool": "p"}]}"#,
        )
        .unwrap();
        assert_eq!(config.interface.as_deref(), Some(":8080"));
        assert_eq!(config.databases[0].bucket.as_deref(), Some("other"));
        assert_eq!(config.databases[0].pool.as_deref(), Some("p"));
    }

    #[test]
    fn empty_database_list_is_rejected() {
        assert!(ServerConfig::from_json(br#"{"databases": []}"#).is_err());
        assert!(ServerConfig::from_json(br#"{}"#).is_err());
        assert!(ServerConfig::from_json(b"not json").is_err());
    }
}
