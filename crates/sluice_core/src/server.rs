//! The server context: one immutable map of database contexts.

use crate::config::ServerConfig;
use crate::database::DatabaseContext;
use crate::error::{CoreError, CoreResult};
use regex::Regex;
use sluice_kv::Bucket;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

fn db_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][-a-z0-9_$()+/]*$").expect("invalid db name pattern"))
}

/// Is this a legal database name for the REST API?
#[must_use]
pub fn is_valid_database_name(name: &str) -> bool {
    db_name_regex().is_match(name)
}

/// Shared context of all request handlers.
///
/// Built once at startup and immutable afterwards, so handlers on any
/// number of threads can read it without locks. Per-database mutable
/// state lives inside each [`DatabaseContext`].
pub struct ServerContext {
    config: ServerConfig,
    databases: HashMap<String, Arc<DatabaseContext>>,
}

/// Builds a [`ServerContext`], one database at a time.
#[derive(Default)]
pub struct ServerContextBuilder {
    config: ServerConfig,
    databases: HashMap<String, Arc<DatabaseContext>>,
}

impl ServerContextBuilder {
    /// Starts a builder with the given configuration.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            databases: HashMap::new(),
        }
    }

    /// Adds a database served from `bucket` under `name` (the bucket's
    /// own name if empty).
    ///
    /// # Errors
    ///
    /// Fails on an illegal or duplicate database name.
    pub fn add_database(
        mut self,
        bucket: Arc<dyn Bucket>,
        name: &str,
    ) -> CoreResult<Self> {
        let name = if name.is_empty() { bucket.name() } else { name }.to_string();
        let name = name.as_str();
        if !is_valid_database_name(name) {
            return Err(CoreError::bad_request(format!(
                "illegal database name {name:?}"
            )));
        }
        if self.databases.contains_key(name) {
            return Err(CoreError::bad_request(format!(
                "duplicate database name {name:?}"
            )));
        }

        let ctx = DatabaseContext::new(name, bucket)?;
        info!(database = name, "opened database");
        self.databases.insert(name.to_string(), ctx);
        Ok(self)
    }

    /// Finishes the build.
    ///
    /// Databases named in the configuration but never added are
    /// warned about; an evaluator host is expected to add them with
    /// their buckets before calling this.
    #[must_use]
    pub fn build(self) -> ServerContext {
        for db in &self.config.databases {
            if !self.databases.contains_key(&db.name) {
                warn!(database = %db.name, "configured database was never opened");
            }
        }
        ServerContext {
            config: self.config,
            databases: self.databases,
        }
    }
}

impl ServerContext {
    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Looks up a database context by name.
    #[must_use]
    pub fn database(&self, name: &str) -> Option<&Arc<DatabaseContext>> {
        self.databases.get(name)
    }

    /// The names of all served databases, sorted.
    #[must_use]
    pub fn database_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.databases.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("databases", &self.database_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_kv::MemoryBucket;

    #[test]
    fn database_names_validated() {
        assert!(is_valid_database_name("db"));
        assert!(is_valid_database_name("my-db_2"));
        assert!(!is_valid_database_name("Db"));
        assert!(!is_valid_database_name("1db"));
        assert!(!is_valid_database_name(""));
    }

    #[test]
    fn add_and_look_up_databases() {
        let sc = ServerContextBuilder::new(ServerConfig::default())
            .add_database(Arc::new(MemoryBucket::new("alpha")), "")
            .unwrap()
            .add_database(Arc::new(MemoryBucket::new("ignored")), "beta")
            .unwrap()
            .build();

        assert!(sc.database("alpha").is_some());
        assert!(sc.database("beta").is_some());
        assert!(sc.database("gamma").is_none());
        assert_eq!(sc.database_names(), vec!["alpha", "beta"]);
    }

    #[test]
    fn duplicate_and_illegal_names_rejected() {
        let builder = ServerContextBuilder::new(ServerConfig::default())
            .add_database(Arc::new(MemoryBucket::new("db")), "")
            .unwrap();
        assert!(builder
            .add_database(Arc::new(MemoryBucket::new("db")), "")
            .is_err());

        let builder = ServerContextBuilder::new(ServerConfig::default());
        assert!(builder
            .add_database(Arc::new(MemoryBucket::new("BAD")), "")
            .is_err());
    }
}
