//! Connection and pool configuration, built programmatically —
//! connection-string URL parsing is out of scope for this crate.

use std::collections::HashMap;
use std::time::Duration;

/// Immutable once built; cloned freely (every [`crate::Wire`] and every
/// connection a [`crate::Pool`] opens gets its own copy).
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub runtime_params: HashMap<String, String>,
    /// `None` disables automatic reconnect entirely.
    pub reconnect_delay: Option<Duration>,
    pub verbose: bool,
}

impl ConnectConfig {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, database: impl Into<String>) -> Self {
        ConnectConfig {
            host: host.into(),
            port,
            user: user.into(),
            password: None,
            database: database.into(),
            runtime_params: HashMap::new(),
            reconnect_delay: Some(Duration::from_secs(1)),
            verbose: false,
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn runtime_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.runtime_params.insert(name.into(), value.into());
        self
    }

    pub fn reconnect_delay(mut self, delay: Option<Duration>) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// `host` starting with `/` selects a Unix-domain socket at
    /// `<host>/.s.PGSQL.<port>`.
    pub fn is_unix_socket(&self) -> bool {
        self.host.starts_with('/')
    }

    pub fn unix_socket_path(&self) -> String {
        format!("{}/.s.PGSQL.{}", self.host, self.port)
    }

    /// The full `StartupMessage` parameter map: `application_name` and
    /// `idle_session_timeout` default but yield to user overrides;
    /// `user`/`database`/`bytea_output`/`client_encoding`/`DateStyle` are
    /// forced regardless of what `runtime_params` says.
    pub fn startup_params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert("application_name".to_string(), "pglue".to_string());
        params.insert("idle_session_timeout".to_string(), "0".to_string());
        for (k, v) in &self.runtime_params {
            params.insert(k.clone(), v.clone());
        }
        params.insert("user".to_string(), self.user.clone());
        let database = if self.database.is_empty() { self.user.clone() } else { self.database.clone() };
        params.insert("database".to_string(), database);
        params.insert("bytea_output".to_string(), "hex".to_string());
        params.insert("client_encoding".to_string(), "utf8".to_string());
        params.insert("DateStyle".to_string(), "ISO".to_string());
        params
    }
}

/// Pool construction parameters: a bounded number of
/// connections sharing one [`ConnectConfig`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub connect: ConnectConfig,
    pub max_connections: usize,
    /// Accepted but not enforced — no background task reclaims idle free
    /// connections. Kept on the struct so a reclaim loop can be added later
    /// without an API break.
    pub idle_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new(connect: ConnectConfig, max_connections: usize) -> Self {
        PoolConfig { connect, max_connections, idle_timeout: None }
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_params_override_user_supplied_values() {
        let config = ConnectConfig::new("localhost", 5432, "alice", "mydb")
            .runtime_param("client_encoding", "latin1")
            .runtime_param("DateStyle", "Postgres");
        let params = config.startup_params();
        assert_eq!(params.get("client_encoding").unwrap(), "utf8");
        assert_eq!(params.get("DateStyle").unwrap(), "ISO");
        assert_eq!(params.get("user").unwrap(), "alice");
    }

    #[test]
    fn user_overrides_default_application_name() {
        let config = ConnectConfig::new("localhost", 5432, "alice", "mydb").runtime_param("application_name", "myapp");
        assert_eq!(config.startup_params().get("application_name").unwrap(), "myapp");
    }

    #[test]
    fn empty_database_falls_back_to_user() {
        let config = ConnectConfig::new("localhost", 5432, "alice", "");
        assert_eq!(config.startup_params().get("database").unwrap(), "alice");
    }

    #[test]
    fn unix_socket_detected_by_leading_slash() {
        let config = ConnectConfig::new("/var/run/postgresql", 5432, "alice", "mydb");
        assert!(config.is_unix_socket());
        assert_eq!(config.unix_socket_path(), "/var/run/postgresql/.s.PGSQL.5432");
    }
}
