use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Runtime settings, read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    pub db_busy_timeout: Duration,
    pub request_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let database_url = match std::env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => url,
            _ => default_database_url(),
        };

        let port = parse_or("PORT", std::env::var("PORT").ok(), 3000u16)?;
        let db_max_connections = parse_or(
            "DB_MAX_CONNECTIONS",
            std::env::var("DB_MAX_CONNECTIONS").ok(),
            5u32,
        )?;
        let busy_timeout_ms = parse_or(
            "DB_BUSY_TIMEOUT_MS",
            std::env::var("DB_BUSY_TIMEOUT_MS").ok(),
            5_000u64,
        )?;
        let request_timeout_secs = parse_or(
            "REQUEST_TIMEOUT_SECS",
            std::env::var("REQUEST_TIMEOUT_SECS").ok(),
            10u64,
        )?;

        if db_max_connections == 0 {
            return Err(ConfigError::Zero("DB_MAX_CONNECTIONS"));
        }
        if request_timeout_secs == 0 {
            return Err(ConfigError::Zero("REQUEST_TIMEOUT_SECS"));
        }

        Ok(Self {
            database_url,
            port,
            db_max_connections,
            db_busy_timeout: Duration::from_millis(busy_timeout_ms),
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }
}

fn default_database_url() -> String {
    // Production images mount a volume at /data
    if std::path::Path::new("/data").exists() {
        "sqlite:/data/convo.db".to_string()
    } else {
        std::fs::create_dir_all("./data").ok();
        "sqlite:./data/convo.db".to_string()
    }
}

fn parse_or<T: FromStr>(
    name: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) if value.trim().is_empty() => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_value_uses_default() {
        assert_eq!(parse_or("PORT", None, 3000u16).unwrap(), 3000);
        assert_eq!(parse_or("PORT", Some("  ".into()), 3000u16).unwrap(), 3000);
    }

    #[test]
    fn parses_trimmed_value() {
        assert_eq!(parse_or("PORT", Some(" 8080 ".into()), 3000u16).unwrap(), 8080);
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_or("PORT", Some("eighty".into()), 3000u16).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PORT", .. }));
    }
}
