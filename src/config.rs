//! Runtime configuration read from the process environment, optionally
//! seeded from a `.env` file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::services::realtime::DEFAULT_QUEUE_CAPACITY;
use crate::store::{RetentionLimits, DEFAULT_RETENTION_DAYS};

pub const DEFAULT_NAMESPACE: &str = "apru40";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_POOL_SIZE: u32 = 8;
pub const DEFAULT_DB_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_STATS_EVERY: u64 = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: String,
    /// First topic level, also used to build default gateway command prefixes.
    pub namespace: String,
    pub workers: usize,
    pub pool_size: u32,
    /// Pool checkout timeout and per-transaction statement timeout.
    pub db_timeout: Duration,
    pub retention_days: u32,
    pub retention: RetentionLimits,
    /// `None` disables stale demotion.
    pub stale_after: Option<Duration>,
    pub broadcast_queue: usize,
    pub stats_every: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").ok_or_else(|| "DATABASE_URL must be set".to_string())?;
        let namespace = get("TOPIC_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if namespace.contains('/') {
            return Err("TOPIC_NAMESPACE must be a single topic level".to_string());
        }

        let workers = positive(&get, "INGEST_WORKERS", DEFAULT_WORKERS)?;
        let pool_size = positive(&get, "DB_POOL_SIZE", DEFAULT_POOL_SIZE)?;
        let timeout_ms = positive(&get, "DB_TIMEOUT_MS", DEFAULT_DB_TIMEOUT_MS)?;
        let retention_days = positive(&get, "RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?;
        let defaults = RetentionLimits::default();
        let batch_size = positive(&get, "RETENTION_BATCH_SIZE", defaults.batch_size)?;
        let max_secs = positive(&get, "RETENTION_MAX_SECS", defaults.max_duration.as_secs())?;
        let stale_after = match get("STALE_AFTER_SECS") {
            Some(_) => Some(Duration::from_secs(positive(&get, "STALE_AFTER_SECS", 0u64)?)),
            None => None,
        };
        let broadcast_queue = positive(&get, "BROADCAST_QUEUE", DEFAULT_QUEUE_CAPACITY)?;
        let stats_every = positive(&get, "STATS_EVERY", DEFAULT_STATS_EVERY)?;

        Ok(Config {
            database_url,
            namespace,
            workers,
            pool_size,
            db_timeout: Duration::from_millis(timeout_ms),
            retention_days,
            retention: RetentionLimits {
                batch_size,
                max_duration: Duration::from_secs(max_secs),
            },
            stale_after,
            broadcast_queue,
            stats_every,
        })
    }
}

fn positive<T, G>(get: &G, key: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr + PartialOrd + Default,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.parse::<T>() {
            Ok(v) if v > T::default() => Ok(v),
            _ => Err(format!("{} must be a positive integer, got {:?}", key, raw)),
        },
    }
}

/// Reads `KEY=VALUE` lines from `path` into the process environment.
/// Variables already present in the environment are left alone.
pub fn load_env_file(path: &Path) -> Result<usize, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let mut applied = 0;
    for (key, value) in parse_env(&content).map_err(|e| format!("{}:{}", path.display(), e))? {
        if std::env::var_os(&key).is_none() {
            // Mutating the environment is only sound before other threads start.
            unsafe {
                std::env::set_var(&key, value);
            }
            applied += 1;
        }
    }
    Ok(applied)
}

/// Parses dotenv content. Supports `export` prefixes, `#` comments and
/// single or double quoted values; `\n`, `\t` and `\"` are unescaped in
/// double quotes.
pub fn parse_env(content: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
        let (key, raw) = line
            .split_once('=')
            .ok_or_else(|| format!("{}: missing '=' in assignment", index + 1))?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(format!("{}: invalid variable name {:?}", index + 1, key));
        }
        let value = unquote(raw.trim()).map_err(|e| format!("{}: {}", index + 1, e))?;
        out.push((key.to_string(), value));
    }
    Ok(out)
}

fn unquote(raw: &str) -> Result<String, String> {
    let Some(quote) = raw.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        // Unquoted: an inline comment ends the value.
        return Ok(raw.split(" #").next().unwrap_or_default().trim_end().to_string());
    };

    let mut value = String::new();
    let mut chars = raw[1..].chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quote == '"' => match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(other) => value.push(other),
                None => break,
            },
            c if c == quote => {
                let rest = chars.as_str().trim();
                return if rest.is_empty() || rest.starts_with('#') {
                    Ok(value)
                } else {
                    Err("unexpected characters after closing quote".to_string())
                };
            }
            c => value.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, String> {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_only_url_is_set() {
        let cfg = config(&[("DATABASE_URL", "postgres://localhost/apru40")]).expect("config");
        assert_eq!(cfg.namespace, "apru40");
        assert_eq!(cfg.workers, DEFAULT_WORKERS);
        assert_eq!(cfg.db_timeout, Duration::from_millis(5_000));
        assert_eq!(cfg.retention_days, 7);
        assert_eq!(cfg.retention, RetentionLimits::default());
        assert_eq!(cfg.stale_after, None);
        assert_eq!(cfg.broadcast_queue, 256);
    }

    #[test]
    fn overrides_and_validation() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://db/x"),
            ("TOPIC_NAMESPACE", "plant"),
            ("INGEST_WORKERS", "12"),
            ("STALE_AFTER_SECS", "600"),
            ("RETENTION_BATCH_SIZE", "500"),
        ])
        .expect("config");
        assert_eq!(cfg.namespace, "plant");
        assert_eq!(cfg.workers, 12);
        assert_eq!(cfg.stale_after, Some(Duration::from_secs(600)));
        assert_eq!(cfg.retention.batch_size, 500);

        assert!(config(&[]).is_err());
        assert!(config(&[("DATABASE_URL", "x"), ("INGEST_WORKERS", "0")]).is_err());
        assert!(config(&[("DATABASE_URL", "x"), ("DB_TIMEOUT_MS", "soon")]).is_err());
        assert!(config(&[("DATABASE_URL", "x"), ("TOPIC_NAMESPACE", "a/b")]).is_err());
    }

    #[test]
    fn parses_dotenv_lines() {
        let parsed = parse_env(
            "# comment\nexport DATABASE_URL=postgres://db/x\nNAME=\"two\\nlines\" # note\nRAW='a # b'\nPLAIN=value # trailing\nEMPTY=\n",
        )
        .expect("parse");
        assert_eq!(
            parsed,
            vec![
                ("DATABASE_URL".to_string(), "postgres://db/x".to_string()),
                ("NAME".to_string(), "two\nlines".to_string()),
                ("RAW".to_string(), "a # b".to_string()),
                ("PLAIN".to_string(), "value".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );

        assert!(parse_env("NO_EQUALS").is_err());
        assert!(parse_env("BAD KEY=1").is_err());
        assert!(parse_env("OPEN=\"never closed").is_err());
    }
}
