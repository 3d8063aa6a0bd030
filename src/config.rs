//! RoomCast configuration
//!
//! Configuration comes from:
//! 1. A TOML file (`--config`)
//! 2. Environment variable overrides (`ROOMCAST_*`)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::publish::{PubMethod, PubTarget};

/// Default listen port
const DEFAULT_PORT: u16 = 9001;

/// Most placeholders a publish parameter template may consume
/// (cmd, subcmd, uid, sid, rid, body).
pub const MAX_PARAM_ARGS: usize = 6;

/// RoomCast configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and per-connection limits
    pub server: ServerConfig,
    /// In-memory message log
    pub msg_log: MsgLogConfig,
    /// Publish targets keyed by subcommand ("1", "2", ...)
    pub pubs: HashMap<String, PubConfig>,
}

/// Listener and per-connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// Socket receive buffer size in bytes
    pub read_buffer: u32,
    /// Socket send buffer size in bytes
    pub write_buffer: u32,
    /// Maximum rooms a single connection may join
    pub max_room_num: usize,
    /// Maximum encoded frame length accepted from a client
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            read_buffer: 4096,
            write_buffer: 4096,
            max_room_num: 10,
            max_frame_len: 64 * 1024,
        }
    }
}

/// Message log settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MsgLogConfig {
    /// Entries retained per (room, subcommand)
    pub capacity: usize,
}

impl Default for MsgLogConfig {
    fn default() -> Self {
        Self { capacity: 20 }
    }
}

/// Raw publish target as written in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct PubConfig {
    /// Address kind handed to the address resolver (e.g. "ip")
    #[serde(default)]
    pub addr_type: String,
    /// Backend address, `host:port` unless a resolver rewrites it
    pub addr: String,
    /// "get" or "post"
    pub method: String,
    /// Parameter template, e.g. `cmd=%s&subcmd=%s&uid=%s&sid=%s&rid=%s&text=%s`
    #[serde(default)]
    pub params: String,
    /// Per-attempt timeout, Go duration syntax ("300ms", "1s")
    #[serde(default)]
    pub timeout: String,
    /// Retry budget (total attempts are capped at 3)
    #[serde(default = "default_retry")]
    pub retry: u32,
    /// Request path on the backend
    #[serde(default)]
    pub cgi: String,
    /// Value of the `Host` header
    #[serde(default)]
    pub host: String,
}

fn default_retry() -> u32 {
    1
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROOMCAST_*` environment overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("ROOMCAST_LISTEN") {
            self.server.listen = listen
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("ROOMCAST_LISTEN", "expected host:port"))?;
        }

        if let Some(max) = lookup("ROOMCAST_MAX_ROOM_NUM") {
            self.server.max_room_num = max
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("ROOMCAST_MAX_ROOM_NUM", "expected usize"))?;
        }

        if let Some(rbuf) = lookup("ROOMCAST_READ_BUFFER") {
            self.server.read_buffer = rbuf
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("ROOMCAST_READ_BUFFER", "expected u32"))?;
        }

        if let Some(wbuf) = lookup("ROOMCAST_WRITE_BUFFER") {
            self.server.write_buffer = wbuf
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("ROOMCAST_WRITE_BUFFER", "expected u32"))?;
        }

        self.validate()
    }

    /// Check limits and every publish target
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_room_num == 0 {
            return Err(ConfigError::Invalid("server.max_room_num must be at least 1"));
        }
        if self.msg_log.capacity == 0 {
            return Err(ConfigError::Invalid("msg_log.capacity must be at least 1"));
        }
        self.pub_targets().map(|_| ())
    }

    /// Build the validated publish target table
    pub fn pub_targets(&self) -> Result<HashMap<u8, PubTarget>, ConfigError> {
        self.pubs
            .iter()
            .map(|(key, raw)| {
                let subcmd: u8 = key.trim().parse().map_err(|_| ConfigError::InvalidPub {
                    subcmd: key.clone(),
                    reason: "subcommand must be an integer in 0..=255".to_string(),
                })?;
                let target = raw.to_target().map_err(|reason| ConfigError::InvalidPub {
                    subcmd: key.clone(),
                    reason,
                })?;
                Ok((subcmd, target))
            })
            .collect()
    }
}

impl PubConfig {
    fn to_target(&self) -> Result<PubTarget, String> {
        let method = match self.method.to_ascii_lowercase().as_str() {
            "get" => PubMethod::Get,
            "post" => PubMethod::Post,
            other => return Err(format!("unsupported method {other:?}")),
        };

        let timeout = if self.timeout.trim().is_empty() {
            None
        } else {
            let parsed = parse_duration(self.timeout.trim())?;
            if parsed.is_zero() { None } else { Some(parsed) }
        };

        if self.retry == 0 {
            return Err("retry must be at least 1".to_string());
        }

        check_template(&self.params)?;

        if self.addr.trim().is_empty() {
            return Err("addr must not be empty".to_string());
        }

        Ok(PubTarget {
            addr_type: self.addr_type.clone(),
            addr: self.addr.clone(),
            method,
            params: self.params.clone(),
            timeout,
            retry: self.retry,
            cgi: self.cgi.clone(),
            host: self.host.clone(),
        })
    }
}

/// Verify a parameter template only uses `%s`, `%v` and `%%`, and does not
/// consume more arguments than a PUB provides.
fn check_template(template: &str) -> Result<(), String> {
    let mut placeholders = 0;
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        match chars.next() {
            Some('s') | Some('v') => placeholders += 1,
            Some('%') => {}
            Some(other) => return Err(format!("unsupported verb %{other} in params")),
            None => return Err("dangling % at end of params".to_string()),
        }
    }
    if placeholders > MAX_PARAM_ARGS {
        return Err(format!(
            "params uses {placeholders} placeholders, at most {MAX_PARAM_ARGS} are available"
        ));
    }
    Ok(())
}

/// Parse a Go-style duration string: `"300ms"`, `"1.5s"`, `"1m30s"`, `"0"`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration {input:?}")),
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        rest = &rest[unit_len..];
        total += value * nanos_per_unit;
    }

    Ok(Duration::from_nanos(total.round() as u64))
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    PathBuf::from("roomcast.toml")
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid environment variable {0}: {1}")]
    InvalidEnv(&'static str, &'static str),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
    #[error("invalid publish target {subcmd}: {reason}")]
    InvalidPub { subcmd: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
listen = "127.0.0.1:9100"
max_room_num = 3

[msg_log]
capacity = 5

[pubs.1]
addr_type = "ip"
addr = "127.0.0.1:8080"
method = "post"
params = "cmd=%s&subcmd=%s&uid=%s&sid=%s&rid=%s&text=%s"
timeout = "500ms"
retry = 2
cgi = "/conn/pub"
host = "backend.local"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server.listen.port(), 9100);
        assert_eq!(config.server.max_room_num, 3);
        assert_eq!(config.server.read_buffer, 4096);
        assert_eq!(config.msg_log.capacity, 5);

        let targets = config.pub_targets().unwrap();
        let target = &targets[&1];
        assert_eq!(target.method, PubMethod::Post);
        assert_eq!(target.timeout, Some(Duration::from_millis(500)));
        assert_eq!(target.retry, 2);
        assert_eq!(target.host, "backend.local");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.server.listen.port(), 9001);
        assert_eq!(config.server.max_room_num, 10);
        assert!(config.pubs.is_empty());
    }

    #[test]
    fn test_rejects_bad_subcmd_key() {
        let raw = r#"
[pubs.abc]
addr = "127.0.0.1:1"
method = "get"
"#;
        let err = Config::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPub { .. }));
    }

    #[test]
    fn test_rejects_unknown_method() {
        let raw = r#"
[pubs.2]
addr = "127.0.0.1:1"
method = "put"
"#;
        let err = Config::from_toml_str(raw).unwrap_err();
        assert!(err.to_string().contains("unsupported method"));
    }

    #[test]
    fn test_rejects_zero_retry() {
        let raw = r#"
[pubs.2]
addr = "127.0.0.1:1"
method = "get"
retry = 0
"#;
        assert!(Config::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_rejects_template_with_too_many_placeholders() {
        let raw = r#"
[pubs.2]
addr = "127.0.0.1:1"
method = "get"
params = "a=%s&b=%s&c=%s&d=%s&e=%s&f=%s&g=%s"
"#;
        assert!(Config::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_rejects_zero_max_rooms() {
        let raw = "[server]\nmax_room_num = 0\n";
        assert!(matches!(
            Config::from_toml_str(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(|key| match key {
                "ROOMCAST_LISTEN" => Some("127.0.0.1:7000".to_string()),
                "ROOMCAST_MAX_ROOM_NUM" => Some("42".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.listen.port(), 7000);
        assert_eq!(config.server.max_room_num, 42);
    }

    #[test]
    fn test_env_override_invalid() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|key| (key == "ROOMCAST_MAX_ROOM_NUM").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv("ROOMCAST_MAX_ROOM_NUM", _)));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("ms").is_err());
    }
}
