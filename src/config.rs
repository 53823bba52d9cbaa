use crate::error::{DashboardError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Login limiter settings
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Consecutive failures that trigger a lockout
    pub max_attempts: u32,

    /// How long a locked-out username has to wait
    pub cooldown: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Account created on startup when the credential store has no entry for it
#[derive(Debug, Clone)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
}

/// Application configuration
///
/// Read from the process environment (a `.env` file is honoured by the
/// binary). Every value has a default so a bare `salesboard-web` starts on
/// `127.0.0.1:3000` with its data under `./database`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub credentials_file: PathBuf,
    pub uploads_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub session_ttl: Duration,
    pub limiter: LimiterConfig,
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

const DEFAULT_DATA_DIR: &str = "database";
const DEFAULT_SESSION_TTL: u64 = 8 * 60 * 60; // 8 hours in seconds
const DEFAULT_MAX_UPLOAD_MB: usize = 20;

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("APP_HOST").unwrap_or_else(|| "127.0.0.1".into());
        let port = parse_or("APP_PORT", &lookup, 3000u16)?;

        let data_dir = PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.into()));
        let credentials_file = lookup("CREDENTIALS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("users.json"));
        let uploads_dir = lookup("UPLOADS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("uploads"));
        let static_dir = PathBuf::from(lookup("STATIC_DIR").unwrap_or_else(|| "static".into()));
        let max_upload_bytes =
            parse_or("MAX_UPLOAD_MB", &lookup, DEFAULT_MAX_UPLOAD_MB)?.saturating_mul(1024 * 1024);

        let session_ttl = Duration::from_secs(parse_or(
            "SESSION_TTL_SECS",
            &lookup,
            DEFAULT_SESSION_TTL,
        )?);

        let max_attempts = parse_or("LOGIN_MAX_ATTEMPTS", &lookup, 3u32)?;
        if max_attempts == 0 {
            return Err(DashboardError::Config(
                "LOGIN_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        let cooldown = Duration::from_secs(parse_or("LOGIN_COOLDOWN_SECS", &lookup, 30u64)?);

        let bootstrap_admin = match (lookup("ADMIN_USERNAME"), lookup("ADMIN_PASSWORD")) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(BootstrapAdmin { username, password })
            }
            _ => None,
        };

        Ok(Self {
            host,
            port,
            data_dir,
            credentials_file,
            uploads_dir,
            static_dir,
            max_upload_bytes,
            session_ttl,
            limiter: LimiterConfig {
                max_attempts,
                cooldown,
            },
            bootstrap_admin,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> Result<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DashboardError::Config(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(default),
    }
}
