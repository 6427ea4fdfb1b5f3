use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Optional on-disk configuration, loaded from terminator.toml.
///
/// Credentials never live here; the database URL and the shared secret
/// come from the environment (or CLI flags) only.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Label reported in pg_stat_activity for the reserved session.
    pub application_name: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight requests may keep running after a shutdown signal.
    pub drain_timeout_secs: u64,
    pub release_timeout_secs: u64,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3493,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            application_name: "postgres-terminator".to_string(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 5,
            release_timeout_secs: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("POSTGRES_URL must be set")]
    MissingPostgresUrl,
    #[error("SECRET_KEY must be set")]
    MissingSecretKey,
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid bind address {0:?}")]
    InvalidBind(String),
}

/// Load the config file at `path`, falling back to defaults when it does not exist.
///
/// A file that exists but cannot be read or parsed is an error.
pub fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(FileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Values taken from the environment or the command line. These win over the file.
#[derive(Default)]
pub struct Overrides {
    pub postgres_url: Option<String>,
    pub secret_key: Option<String>,
    pub port: Option<u16>,
    pub bind: Option<String>,
}

/// Fully resolved, validated process configuration. Immutable after startup.
pub struct Settings {
    pub postgres_url: String,
    pub secret_key: String,
    pub listen_addr: SocketAddr,
    pub application_name: String,
    pub drain_timeout: std::time::Duration,
    pub release_timeout: std::time::Duration,
}

impl Settings {
    /// Merge file values with overrides and validate.
    ///
    /// Empty strings count as unset for the database URL and the secret.
    pub fn resolve(file: FileConfig, overrides: Overrides) -> Result<Settings, ConfigError> {
        let postgres_url = overrides
            .postgres_url
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingPostgresUrl)?;
        let secret_key = overrides
            .secret_key
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSecretKey)?;

        let bind = overrides.bind.unwrap_or(file.server.bind);
        let ip: IpAddr = bind.parse().map_err(|_| ConfigError::InvalidBind(bind))?;
        let port = overrides.port.unwrap_or(file.server.port);

        Ok(Settings {
            postgres_url,
            secret_key,
            listen_addr: SocketAddr::new(ip, port),
            application_name: file.database.application_name,
            drain_timeout: std::time::Duration::from_secs(file.shutdown.drain_timeout_secs),
            release_timeout: std::time::Duration::from_secs(file.shutdown.release_timeout_secs),
        })
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("postgres_url", &redact_url(&self.postgres_url))
            .field("secret_key", &"<redacted>")
            .field("listen_addr", &self.listen_addr)
            .field("application_name", &self.application_name)
            .field("drain_timeout", &self.drain_timeout)
            .field("release_timeout", &self.release_timeout)
            .finish()
    }
}

/// Strip credentials from a connection URL for display.
///
/// `postgres://user:pw@host/db?password=pw` becomes
/// `postgres://<redacted>@host/db?<redacted>`. libpq accepts credentials in
/// both places, so the whole query string goes. Strings that are not URLs
/// (key=value DSNs) are hidden entirely.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return "<redacted>".to_string();
    };
    let (base, query) = match rest.split_once('?') {
        Some((base, _)) => (base, "?<redacted>"),
        None => (rest, ""),
    };
    match base.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://<redacted>@{host}{query}"),
        None => format!("{scheme}://{base}{query}"),
    }
}
