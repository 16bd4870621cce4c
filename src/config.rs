//! Daemon configuration.
//!
//! `/etc/xbatd/xbatd.conf` is a small INI file with `general`, `restapi`
//! and `clickhouse` sections. Parsed by hand; the format is three sections
//! of `key = value` lines and comments.

use std::collections::HashMap;
use std::fs;

use log::LevelFilter;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/xbatd/xbatd.conf";
pub const JOB_INFO_PATH: &str = "/run/xbatd/job";
pub const BENCHMARK_SENTINEL_PATH: &str = "/run/xbatd/benchmarkInProgress";
pub const METRICS_DICTIONARY_PATH: &str = "/usr/local/share/xbatd/metrics.json";
pub const LOG_FILE_PATH: &str = "/var/log/xbatd/xbatd.log";

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub log_level: LevelFilter,
    pub log_level_file: LevelFilter,
}

#[derive(Debug, Clone)]
pub struct RestApiConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    pub restapi: RestApiConfig,
    pub clickhouse: ClickHouseConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let sections = parse_ini(raw)?;

        Ok(Config {
            general: GeneralConfig {
                log_level: level_key(&sections, "general", "log_level")?,
                log_level_file: level_key(&sections, "general", "log_level_file")?,
            },
            restapi: RestApiConfig {
                host: string_key(&sections, "restapi", "host")?,
                port: port_key(&sections, "restapi", "port")?,
                client_id: string_key(&sections, "restapi", "client_id")?,
                client_secret: string_key(&sections, "restapi", "client_secret")?,
            },
            clickhouse: ClickHouseConfig {
                host: string_key(&sections, "clickhouse", "host")?,
                port: port_key(&sections, "clickhouse", "port")?,
                database: string_key(&sections, "clickhouse", "database")?,
                user: string_key(&sections, "clickhouse", "user")?,
                password: string_key(&sections, "clickhouse", "password")?,
            },
        })
    }
}

type Sections = HashMap<String, HashMap<String, String>>;

fn parse_ini(raw: &str) -> Result<Sections, ConfigError> {
    let mut sections: Sections = HashMap::new();
    let mut current: Option<String> = None;

    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[') {
            let Some(name) = name.strip_suffix(']') else {
                return Err(ConfigError::Syntax {
                    line: idx + 1,
                    message: format!("unterminated section header `{line}`"),
                });
            };
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax {
                line: idx + 1,
                message: format!("expected `key = value`, got `{line}`"),
            });
        };
        let Some(section) = &current else {
            return Err(ConfigError::Syntax {
                line: idx + 1,
                message: "key outside of any section".to_string(),
            });
        };
        sections
            .get_mut(section)
            .map(|s| s.insert(key.trim().to_string(), value.trim().to_string()));
    }

    Ok(sections)
}

fn string_key(sections: &Sections, section: &str, key: &str) -> Result<String, ConfigError> {
    sections
        .get(section)
        .and_then(|s| s.get(key))
        .cloned()
        .ok_or_else(|| ConfigError::MissingKey {
            section: section.to_string(),
            key: key.to_string(),
        })
}

fn port_key(sections: &Sections, section: &str, key: &str) -> Result<u16, ConfigError> {
    let value = string_key(sections, section, key)?;
    value.parse().map_err(|_| ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value,
    })
}

fn level_key(sections: &Sections, section: &str, key: &str) -> Result<LevelFilter, ConfigError> {
    let value = string_key(sections, section, key)?;
    match value.as_str() {
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warning" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        _ => Err(ConfigError::InvalidValue {
            section: section.to_string(),
            key: key.to_string(),
            value,
        }),
    }
}
