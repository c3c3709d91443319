use crate::{
    executor::ExecutorOptions,
    result::{FanoutError, Result},
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_client_encoding() -> String {
    "utf8".to_string()
}

/// Where to connect: supplied once and reused as parameters by every connection the executor opens
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_encoding")]
    pub client_encoding: String,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

impl ConnectionParams {
    pub fn new(dbname: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dbname: dbname.into(),
            user: user.into(),
            password: None,
            client_encoding: default_client_encoding(),
            connect_timeout_ms: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_client_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.client_encoding = encoding.into();
        self
    }

    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Reject parameters no connection could be opened with
    pub fn validate(&self) -> Result<()> {
        if self.dbname.trim().is_empty() {
            return Err(FanoutError::Config("database name is empty".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(FanoutError::Config("user is empty".to_string()));
        }
        let encoding = self.client_encoding.to_ascii_lowercase().replace(['-', '_'], "");
        if encoding != "utf8" {
            return Err(FanoutError::Config(format!(
                "unsupported client encoding '{}', only UTF8 is supported",
                self.client_encoding
            )));
        }
        Ok(())
    }

    #[cfg(feature = "postgresql")]
    pub fn to_postgres_config(&self) -> Result<tokio_postgres::Config> {
        self.validate()?;
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .application_name(env!("CARGO_PKG_NAME"));
        if let Some(password) = &self.password {
            config.password(password);
        }
        if let Some(timeout_ms) = self.connect_timeout_ms {
            config.connect_timeout(std::time::Duration::from_millis(timeout_ms));
        }
        Ok(config)
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_encoding", &self.client_encoding)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

/// Connection target plus executor options, loadable from JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub connection: ConnectionParams,
    #[serde(default)]
    pub options: ExecutorOptions,
}

impl ExecutorConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let json: serde_json::Value = serde_json::from_str(&content)?;
        Ok(Self::from_json(json)?)
    }

    /// Load configuration from a JSON object
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        let config: ExecutorConfig =
            serde_json::from_value(json).map_err(|err| FanoutError::Config(err.to_string()))?;
        config.connection.validate()?;
        config.options.validate()?;
        Ok(config)
    }
}
