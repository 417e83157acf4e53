//! Runtime settings.
//!
//! The same schema is accepted from command-line flags and from an
//! INI-style config file; the binary applies the file first and lets flags
//! override it.

use std::path::PathBuf;

use thiserror::Error;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7012";
pub const DEFAULT_POOL_SIZE: usize = 50;
pub const DEFAULT_POOL_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config line {line}: unknown key '{key}'")]
    UnknownKey { line: usize, key: String },

    #[error("config line {line}: invalid value '{value}' for '{key}'")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },

    #[error("config line {line}: expected 'key = value'")]
    Malformed { line: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Comma-separated bind addresses; entries starting with `/` are unix
    /// socket paths.
    pub listen: String,
    /// Number of workers.
    pub pool_size: usize,
    /// Maximum number of queued jobs.
    pub pool_queue_size: usize,
    /// Source-IP route table, e.g. `172.16.0.0/12 -> 172.16.1.1, 0.0.0.0/0 -> auto`.
    pub ip_routes: String,
    /// Log response bodies of outbound requests answered with 4xx/5xx.
    pub log4xx_responses: bool,
    pub pidfile: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            pool_queue_size: DEFAULT_POOL_QUEUE_SIZE,
            ip_routes: String::new(),
            log4xx_responses: false,
            pidfile: None,
        }
    }
}

impl Settings {
    pub fn listen_addrs(&self) -> Vec<String> {
        self.listen
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Applies an INI-style `key = value` file over the current settings.
    /// Blank lines, `#`/`;` comments and `[section]` headers are ignored;
    /// keys use the flag spellings.
    pub fn apply_file(&mut self, text: &str) -> Result<(), ConfigError> {
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty()
                || trimmed.starts_with('#')
                || trimmed.starts_with(';')
                || trimmed.starts_with('[')
            {
                continue;
            }
            let (key, value) = trimmed
                .split_once('=')
                .ok_or(ConfigError::Malformed { line })?;
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            match key {
                "listen" => self.listen = value.to_string(),
                "pool-size" => self.pool_size = parse_number(line, key, value)?,
                "pool-queue-size" => self.pool_queue_size = parse_number(line, key, value)?,
                "ip-routes" => self.ip_routes = value.to_string(),
                "log4xx-responses" | "log4xxResponses" => {
                    self.log4xx_responses = parse_bool(line, key, value)?
                }
                "pidfile" => {
                    self.pidfile = (!value.is_empty()).then(|| PathBuf::from(value));
                }
                _ => {
                    return Err(ConfigError::UnknownKey {
                        line,
                        key: key.to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}

fn parse_number(line: usize, key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        line,
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(line: usize, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            line,
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.listen, "127.0.0.1:7012");
        assert_eq!(settings.pool_size, 50);
        assert_eq!(settings.pool_queue_size, 10_000);
        assert!(settings.ip_routes.is_empty());
        assert!(!settings.log4xx_responses);
        assert!(settings.pidfile.is_none());
    }

    #[test]
    fn test_apply_file() {
        let mut settings = Settings::default();
        settings
            .apply_file(
                r#"
                # outpost config
                [main]
                listen = 0.0.0.0:8080, /run/outpost.sock
                pool-size = 8
                pool-queue-size = 256
                ip-routes = "0.0.0.0/0 -> auto"
                log4xxResponses = true
                pidfile = /run/outpost.pid
                ; trailing comment
                "#,
            )
            .unwrap();

        assert_eq!(settings.pool_size, 8);
        assert_eq!(settings.pool_queue_size, 256);
        assert_eq!(settings.ip_routes, "0.0.0.0/0 -> auto");
        assert!(settings.log4xx_responses);
        assert_eq!(settings.pidfile, Some(PathBuf::from("/run/outpost.pid")));
        assert_eq!(
            settings.listen_addrs(),
            ["0.0.0.0:8080", "/run/outpost.sock"]
        );
    }

    #[test]
    fn test_unknown_key() {
        let err = Settings::default().apply_file("bogus = 1").unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownKey {
                line: 1,
                key: "bogus".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_number() {
        let err = Settings::default()
            .apply_file("pool-size = many")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_malformed_line() {
        let err = Settings::default().apply_file("just words").unwrap_err();
        assert_eq!(err, ConfigError::Malformed { line: 1 });
    }

    #[test]
    fn test_listen_addrs_trims_entries() {
        let settings = Settings {
            listen: " 127.0.0.1:1, , 127.0.0.1:2 ".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.listen_addrs(), ["127.0.0.1:1", "127.0.0.1:2"]);
    }
}
