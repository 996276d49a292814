use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpanProxyError};
use crate::time::parse_duration_str;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub listen_addr: String,
    pub write_key: Option<String>,
    pub dataset: String,
    pub api_host: String,
    pub sample_rate: u32,
    pub drop_fields: Vec<String>,
    pub debug: bool,
    pub downstream: Option<String>,
    pub mirror_buffer_size: usize,
    pub mirror_concurrency: usize,
    pub mirror_timeout: Duration,
    pub allowed_origins: Vec<String>,
    pub batch_size: usize,
    pub batch_flush_ms: u64,
    pub send_timeout: Duration,
    pub max_body_bytes: usize,
    pub max_inflated_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9411".to_string(),
            write_key: None,
            dataset: String::new(),
            api_host: "https://api.honeycomb.io/".to_string(),
            sample_rate: 1,
            drop_fields: Vec::new(),
            debug: false,
            downstream: None,
            mirror_buffer_size: 4096,
            mirror_concurrency: 100,
            mirror_timeout: Duration::from_secs(10),
            allowed_origins: Vec::new(),
            batch_size: 50,
            batch_flush_ms: 100,
            send_timeout: Duration::from_secs(10),
            max_body_bytes: 16 * 1024 * 1024,
            max_inflated_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }

    pub fn honeycomb_enabled(&self) -> bool {
        self.write_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(SpanProxyError::Config(
                "sample_rate must be at least 1".to_string(),
            ));
        }
        if self.honeycomb_enabled() && self.dataset.is_empty() {
            return Err(SpanProxyError::Config(
                "a dataset is required when a write key is set".to_string(),
            ));
        }
        if self.downstream.is_some() && (self.mirror_buffer_size == 0 || self.mirror_concurrency == 0)
        {
            return Err(SpanProxyError::Config(
                "mirror buffer size and concurrency must be positive".to_string(),
            ));
        }
        if !self.honeycomb_enabled() && !self.debug {
            return Err(SpanProxyError::Config(
                "no sink configured: provide a write key or enable debug output".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    listen_addr: Option<String>,
    write_key: Option<String>,
    dataset: Option<String>,
    api_host: Option<String>,
    sample_rate: Option<u32>,
    drop_fields: Option<Vec<String>>,
    debug: Option<bool>,
    downstream: Option<String>,
    mirror_buffer_size: Option<usize>,
    mirror_concurrency: Option<usize>,
    mirror_timeout: Option<String>,
    allowed_origins: Option<Vec<String>>,
    batch_size: Option<usize>,
    batch_flush_ms: Option<u64>,
    send_timeout: Option<String>,
    max_body_bytes: Option<usize>,
    max_inflated_bytes: Option<u64>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("SPANPROXY_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("spanproxy/config.toml")
}

fn load_file_overrides(path: &Path) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| SpanProxyError::Config(format!("failed reading {}: {e}", path.display())))?;
    let parsed: ConfigOverrides = toml::from_str(&raw)
        .map_err(|e| SpanProxyError::Config(format!("failed parsing {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    Ok(ConfigOverrides {
        listen_addr: env::var("SPANPROXY_LISTEN_ADDR").ok(),
        write_key: env::var("HONEYCOMB_WRITEKEY").ok(),
        dataset: env::var("SPANPROXY_DATASET").ok(),
        api_host: env::var("SPANPROXY_API_HOST").ok(),
        sample_rate: parse_env("SPANPROXY_SAMPLE_RATE")?,
        drop_fields: env::var("SPANPROXY_DROP_FIELDS")
            .ok()
            .map(|v| split_list(&v, ',')),
        debug: parse_env("SPANPROXY_DEBUG")?,
        downstream: env::var("SPANPROXY_DOWNSTREAM").ok(),
        mirror_buffer_size: parse_env("SPANPROXY_MIRROR_BUFFER_SIZE")?,
        mirror_concurrency: parse_env("SPANPROXY_MIRROR_CONCURRENCY")?,
        mirror_timeout: env::var("SPANPROXY_MIRROR_TIMEOUT").ok(),
        allowed_origins: env::var("ORIGINS_ALLOWED")
            .ok()
            .map(|v| split_list(&v, ';')),
        batch_size: parse_env("SPANPROXY_BATCH_SIZE")?,
        batch_flush_ms: parse_env("SPANPROXY_BATCH_FLUSH_MS")?,
        send_timeout: env::var("SPANPROXY_SEND_TIMEOUT").ok(),
        max_body_bytes: parse_env("SPANPROXY_MAX_BODY_BYTES")?,
        max_inflated_bytes: parse_env("SPANPROXY_MAX_INFLATED_BYTES")?,
    })
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SpanProxyError::Config(format!("bad {name} in environment: {e}"))),
        Err(_) => Ok(None),
    }
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.listen_addr {
        cfg.listen_addr = v;
    }
    if let Some(v) = overrides.write_key {
        cfg.write_key = Some(v);
    }
    if let Some(v) = overrides.dataset {
        cfg.dataset = v;
    }
    if let Some(v) = overrides.api_host {
        cfg.api_host = v;
    }
    if let Some(v) = overrides.sample_rate {
        cfg.sample_rate = v;
    }
    if let Some(v) = overrides.drop_fields {
        cfg.drop_fields = v;
    }
    if let Some(v) = overrides.debug {
        cfg.debug = v;
    }
    if let Some(v) = overrides.downstream {
        cfg.downstream = Some(v).filter(|d| !d.is_empty());
    }
    if let Some(v) = overrides.mirror_buffer_size {
        cfg.mirror_buffer_size = v;
    }
    if let Some(v) = overrides.mirror_concurrency {
        cfg.mirror_concurrency = v;
    }
    if let Some(v) = overrides.mirror_timeout {
        cfg.mirror_timeout = parse_duration_str(&v)
            .map_err(|e| SpanProxyError::Config(format!("bad mirror_timeout in {source}: {e}")))?;
    }
    if let Some(v) = overrides.allowed_origins {
        cfg.allowed_origins = v;
    }
    if let Some(v) = overrides.batch_size {
        cfg.batch_size = v;
    }
    if let Some(v) = overrides.batch_flush_ms {
        cfg.batch_flush_ms = v;
    }
    if let Some(v) = overrides.send_timeout {
        cfg.send_timeout = parse_duration_str(&v)
            .map_err(|e| SpanProxyError::Config(format!("bad send_timeout in {source}: {e}")))?;
    }
    if let Some(v) = overrides.max_body_bytes {
        cfg.max_body_bytes = v;
    }
    if let Some(v) = overrides.max_inflated_bytes {
        cfg.max_inflated_bytes = v;
    }
    Ok(())
}

fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debug_config() -> Config {
        Config {
            debug: true,
            ..Config::default()
        }
    }

    #[test]
    fn default_listens_on_zipkin_port() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9411");
        assert_eq!(cfg.sample_rate, 1);
        assert_eq!(cfg.mirror_buffer_size, 4096);
        assert_eq!(cfg.mirror_concurrency, 100);
    }

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(
            split_list("https://a.example; ;https://b.example", ';'),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert!(split_list("", ',').is_empty());
    }

    #[test]
    fn validate_requires_a_sink() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("no sink configured"));
        assert!(debug_config().validate().is_ok());
    }

    #[test]
    fn validate_requires_dataset_with_write_key() {
        let cfg = Config {
            write_key: Some("key".into()),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            dataset: "traces".into(),
            ..cfg
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_sample_rate() {
        let cfg = Config {
            sample_rate: 0,
            ..debug_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn apply_file_overrides_updates_fields() {
        let mut cfg = Config::default();
        let file = ConfigOverrides {
            listen_addr: Some("127.0.0.1:9999".into()),
            sample_rate: Some(10),
            drop_fields: Some(vec!["secret".into()]),
            downstream: Some("http://zipkin:9411/api/v1/spans".into()),
            mirror_timeout: Some("3s".into()),
            ..ConfigOverrides::default()
        };

        apply_overrides(&mut cfg, file, "config file").unwrap();

        assert_eq!(cfg.listen_addr, "127.0.0.1:9999");
        assert_eq!(cfg.sample_rate, 10);
        assert_eq!(cfg.drop_fields, vec!["secret".to_string()]);
        assert_eq!(
            cfg.downstream.as_deref(),
            Some("http://zipkin:9411/api/v1/spans")
        );
        assert_eq!(cfg.mirror_timeout, Duration::from_secs(3));
    }

    #[test]
    fn apply_overrides_rejects_bad_durations() {
        let mut cfg = Config::default();
        let file = ConfigOverrides {
            send_timeout: Some("eventually".into()),
            ..ConfigOverrides::default()
        };
        let err = apply_overrides(&mut cfg, file, "config file").unwrap_err();
        assert!(err.to_string().contains("send_timeout"));
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "dataset = \"traces\"\nwrite_key = \"abc\"\nallowed_origins = [\"https://ui.example\"]\n",
        )
        .unwrap();

        let overrides = load_file_overrides(&path).unwrap().unwrap();
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, overrides, "config file").unwrap();

        assert_eq!(cfg.dataset, "traces");
        assert!(cfg.honeycomb_enabled());
        assert_eq!(cfg.allowed_origins, vec!["https://ui.example".to_string()]);
        assert!(load_file_overrides(&dir.path().join("missing.toml")).unwrap().is_none());
    }
}
