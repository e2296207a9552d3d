use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use config::{Config, ConfigError, File, Map, Value};
use tracing::{debug, instrument};

use crate::schema;
use crate::utils::enums::ExistingPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_ADMIN_PASSWORD_ENV: &str = "EYEGLASS_ADMIN_PASSWORD";
/// When set, replaces the URI built from the `database` section.
pub const MONGODB_URI_ENV: &str = "MONGODB_URI";

#[derive(thiserror::Error, Debug)]
pub enum ConfError {
    #[error("error from config")]
    Config(#[from] ConfigError),
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("failed to read secret file {path}")]
    SecretFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("secret from {0} is empty")]
    EmptySecret(String),
    #[error("admin.password must not be set in the config file, use admin.password_env or admin.password_file")]
    LiteralAdminPassword,
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// A password that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

/// Where a password comes from. Resolution is deferred until the password is
/// actually needed, so loading a config never touches the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PasswordSource {
    Env(String),
    File(PathBuf),
    Literal(Secret),
}

impl PasswordSource {
    pub fn resolve(&self) -> Result<Secret, ConfError> {
        match self {
            PasswordSource::Env(name) => {
                let value =
                    std::env::var(name).map_err(|_| ConfError::MissingEnv(name.clone()))?;
                if value.is_empty() {
                    return Err(ConfError::EmptySecret(name.clone()));
                }
                Ok(Secret(value))
            }
            PasswordSource::File(path) => {
                let value =
                    std::fs::read_to_string(path).map_err(|source| ConfError::SecretFile {
                        path: path.clone(),
                        source,
                    })?;
                // secret files mounted by orchestrators usually end with a newline
                let value = value.trim_end_matches(['\n', '\r']);
                if value.is_empty() {
                    return Err(ConfError::EmptySecret(path.display().to_string()));
                }
                Ok(Secret(value.to_string()))
            }
            PasswordSource::Literal(secret) => Ok(secret.clone()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<PasswordSource>,
    pub auth_database: String,
    pub server_selection_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            name: schema::DATABASE_NAME.to_string(),
            host: "localhost".to_string(),
            port: 27017,
            username: None,
            password: None,
            auth_database: "admin".to_string(),
            server_selection_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl DatabaseConfig {
    /// Connection URI without credentials, which are attached separately.
    pub fn base_uri(&self) -> String {
        format!("mongodb://{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct AdminConfig {
    pub username: String,
    pub password: PasswordSource,
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            username: schema::ADMIN_USERNAME.to_string(),
            password: PasswordSource::Env(DEFAULT_ADMIN_PASSWORD_ENV.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// Delays to wait between consecutive connection attempts. There is one
    /// fewer delay than there are attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial_delay.min(self.max_delay)), |delay| {
            Some(delay.saturating_mul(self.multiplier).min(self.max_delay))
        })
        .take(self.max_attempts.saturating_sub(1) as usize)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProvisionConfig {
    pub on_existing: ExistingPolicy,
}

#[derive(Clone, Debug, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub admin: AdminConfig,
    pub retry: RetryConfig,
    pub provision: ProvisionConfig,
}

impl AppConfig {
    pub fn from_path(config_path: &str) -> Result<Self, ConfError> {
        let conf = load_config(config_path)?;
        Self::from_config(&conf)
    }

    #[instrument(skip_all, err)]
    pub fn from_config(conf: &Config) -> Result<Self, ConfError> {
        let config = AppConfig {
            database: build_database_config(&get_section(conf, "database")?)?,
            admin: build_admin_config(&get_section(conf, "admin")?)?,
            retry: build_retry_config(&get_section(conf, "retry")?)?,
            provision: build_provision_config(&get_section(conf, "provision")?)?,
        };
        debug!(?config);
        Ok(config)
    }
}

pub fn load_config(filepath: &str) -> Result<Config, ConfError> {
    let conf = Config::builder()
        .add_source(File::with_name(filepath))
        .build()?;
    Ok(conf)
}

// a missing section means "all defaults"
fn get_section(conf: &Config, key: &str) -> Result<Map<String, Value>, ConfError> {
    match conf.get_table(key) {
        Ok(table) => Ok(table),
        Err(ConfigError::NotFound(_)) => Ok(Map::new()),
        Err(e) => Err(e.into()),
    }
}

fn get_string(table: &Map<String, Value>, key: &str) -> Result<Option<String>, ConfError> {
    Ok(table
        .get(key)
        .map(|value| value.clone().into_string())
        .transpose()?)
}

fn get_int(table: &Map<String, Value>, key: &str) -> Result<Option<i64>, ConfError> {
    Ok(table
        .get(key)
        .map(|value| value.clone().into_int())
        .transpose()?)
}

fn get_millis(
    table: &Map<String, Value>,
    section: &str,
    key: &str,
) -> Result<Option<Duration>, ConfError> {
    get_int(table, key)?
        .map(|ms| {
            u64::try_from(ms)
                .map(Duration::from_millis)
                .map_err(|_| invalid(section, key, "must not be negative"))
        })
        .transpose()
}

fn invalid(section: &str, key: &str, reason: &str) -> ConfError {
    ConfError::Invalid {
        key: format!("{}.{}", section, key),
        reason: reason.to_string(),
    }
}

fn build_database_config(db_conf: &Map<String, Value>) -> Result<DatabaseConfig, ConfError> {
    let default = DatabaseConfig::default();

    let port = match get_int(db_conf, "port")? {
        Some(port) => {
            u16::try_from(port).map_err(|_| invalid("database", "port", "not a valid port"))?
        }
        None => default.port,
    };

    let password = match (
        get_string(db_conf, "password")?,
        get_string(db_conf, "password_env")?,
    ) {
        (Some(literal), _) => Some(PasswordSource::Literal(Secret::new(literal))),
        (None, Some(name)) => Some(PasswordSource::Env(name)),
        (None, None) => None,
    };

    let name = get_string(db_conf, "name")?.unwrap_or(default.name);
    if name.is_empty() {
        return Err(invalid("database", "name", "must not be empty"));
    }

    Ok(DatabaseConfig {
        name,
        host: get_string(db_conf, "host")?.unwrap_or(default.host),
        port,
        username: get_string(db_conf, "username")?,
        password,
        auth_database: get_string(db_conf, "auth_database")?.unwrap_or(default.auth_database),
        server_selection_timeout: get_millis(db_conf, "database", "server_selection_timeout_ms")?
            .unwrap_or(default.server_selection_timeout),
        connect_timeout: get_millis(db_conf, "database", "connect_timeout_ms")?
            .unwrap_or(default.connect_timeout),
    })
}

fn build_admin_config(admin_conf: &Map<String, Value>) -> Result<AdminConfig, ConfError> {
    if admin_conf.contains_key("password") {
        return Err(ConfError::LiteralAdminPassword);
    }
    let default = AdminConfig::default();

    let password = match get_string(admin_conf, "password_file")? {
        Some(path) => PasswordSource::File(PathBuf::from(path)),
        None => get_string(admin_conf, "password_env")?
            .map(PasswordSource::Env)
            .unwrap_or(default.password),
    };

    Ok(AdminConfig {
        username: get_string(admin_conf, "username")?.unwrap_or(default.username),
        password,
    })
}

fn build_retry_config(retry_conf: &Map<String, Value>) -> Result<RetryConfig, ConfError> {
    let default = RetryConfig::default();

    let max_attempts = match get_int(retry_conf, "max_attempts")? {
        Some(n) => u32::try_from(n)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| invalid("retry", "max_attempts", "must be at least 1"))?,
        None => default.max_attempts,
    };
    let multiplier = match get_int(retry_conf, "multiplier")? {
        Some(n) => u32::try_from(n)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| invalid("retry", "multiplier", "must be at least 1"))?,
        None => default.multiplier,
    };

    Ok(RetryConfig {
        max_attempts,
        initial_delay: get_millis(retry_conf, "retry", "initial_delay_ms")?
            .unwrap_or(default.initial_delay),
        max_delay: get_millis(retry_conf, "retry", "max_delay_ms")?.unwrap_or(default.max_delay),
        multiplier,
    })
}

fn build_provision_config(
    provision_conf: &Map<String, Value>,
) -> Result<ProvisionConfig, ConfError> {
    let on_existing = match get_string(provision_conf, "on_existing")? {
        Some(value) => ExistingPolicy::from_str(value.trim(), true).map_err(|_| {
            invalid("provision", "on_existing", "expected `reconcile` or `fail`")
        })?,
        None => ExistingPolicy::default(),
    };
    Ok(ProvisionConfig { on_existing })
}
