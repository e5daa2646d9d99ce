use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> u64 {
    64 * 1024 * 1024
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_cache_max_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_refresh_timeout_ms() -> u64 {
    2_000
}

fn default_max_restart_count() -> u32 {
    3
}

fn default_worker_pool_size() -> usize {
    16
}

fn default_restart_interval() -> u64 {
    5
}

fn default_eviction_interval() -> u64 {
    60
}

fn default_max_chunk_size() -> usize {
    64 * 1024
}

fn default_disconnect_grace_ms() -> u64 {
    5_000
}

fn default_deletion_queue_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: u64,
    /// Absent means every request is forwarded without caching.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_refresh_timeout_ms")]
    pub refresh_timeout_ms: u64,
    #[serde(default = "default_max_restart_count")]
    pub max_restart_count: u32,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_restart_interval")]
    pub restart_interval: u64,
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval: u64,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    #[serde(default = "default_deletion_queue_capacity")]
    pub deletion_queue_capacity: usize,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("CACHEBAY")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        if let Some(log) = cli.log {
            settings.log = log;
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Settings with every default filled in, listening on `listen`.
    pub fn with_defaults(listen: SocketAddr) -> Self {
        Self {
            listen,
            log: default_log_format(),
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_timeout: default_upstream_timeout(),
            max_request_header_size: default_max_request_header_size(),
            max_response_header_size: default_max_response_header_size(),
            max_request_body_size: default_max_request_body_size(),
            cache_dir: None,
            cache_max_size: default_cache_max_size(),
            cache_max_entries: default_cache_max_entries(),
            refresh_timeout_ms: default_refresh_timeout_ms(),
            max_restart_count: default_max_restart_count(),
            worker_pool_size: default_worker_pool_size(),
            restart_interval: default_restart_interval(),
            eviction_interval: default_eviction_interval(),
            max_chunk_size: default_max_chunk_size(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            deletion_queue_capacity: default_deletion_queue_capacity(),
            metrics_listen: None,
        }
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn cache_max_entries_nonzero(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.cache_max_entries)
            .ok_or_else(|| anyhow::anyhow!("cache_max_entries must be at least 1"))
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/cachebay/cachebay.toml"),
        PathBuf::from("cachebay.toml"),
    ]
}

impl Settings {
    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if let Some(cache_dir) = self.cache_dir.clone() {
            self.cache_dir = Some(absolutize(&cache_dir, base_dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        if self.cache_dir.is_some() {
            ensure!(
                self.cache_max_size > 0,
                "cache_max_size must be greater than 0 (got {})",
                self.cache_max_size
            );
            ensure!(
                self.cache_max_entries > 0,
                "cache_max_entries must be greater than 0 (got {})",
                self.cache_max_entries
            );
            ensure!(
                self.worker_pool_size > 0,
                "worker_pool_size must be greater than 0 (got {})",
                self.worker_pool_size
            );
            ensure!(
                self.max_chunk_size > 0,
                "max_chunk_size must be greater than 0 (got {})",
                self.max_chunk_size
            );
            ensure!(
                self.deletion_queue_capacity > 0,
                "deletion_queue_capacity must be greater than 0 (got {})",
                self.deletion_queue_capacity
            );
            ensure!(
                self.restart_interval > 0,
                "restart_interval must be greater than 0 seconds (got {})",
                self.restart_interval
            );
            ensure!(
                self.eviction_interval > 0,
                "eviction_interval must be greater than 0 seconds (got {})",
                self.eviction_interval
            );
        }
        Ok(())
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let mut settings = Settings::with_defaults("127.0.0.1:0".parse().unwrap());
        settings.cache_dir = Some(PathBuf::from("cache"));
        settings
    }

    #[test]
    fn defaults_validate_with_cache_enabled() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn cache_sizes_must_be_positive() {
        let mut settings = settings();
        settings.cache_max_size = 0;
        assert!(settings.validate().is_err());

        settings.cache_max_size = 1024;
        settings.worker_pool_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn cache_sizes_ignored_without_cache_dir() {
        let mut settings = settings();
        settings.cache_dir = None;
        settings.cache_max_size = 0;
        settings.cache_max_entries = 0;
        settings.eviction_interval = 0;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn loads_toml_with_relative_cache_dir() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("cachebay.toml");
        std::fs::write(
            &path,
            "listen = \"127.0.0.1:3128\"\nlog = \"text\"\ncache_dir = \"store\"\nrefresh_timeout_ms = 250\n",
        )?;
        let cli = Cli {
            config: Some(path),
            log: None,
        };
        let settings = Settings::load(&cli)?;
        assert_eq!(settings.log, LogFormat::Text);
        assert_eq!(settings.cache_dir, Some(dir.path().join("store")));
        assert_eq!(settings.refresh_timeout(), Duration::from_millis(250));
        assert_eq!(settings.max_restart_count, 3);
        Ok(())
    }
}
