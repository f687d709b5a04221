use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

const PORT_ENV: &str = "PORT";
const DEFAULT_CONFIG_FILE: &str = "pictee.toml";

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8000
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("image_cache")
}

fn default_origin_prefix() -> String {
    "https://dn.ht/".to_string()
}

fn default_origin_timeout() -> u64 {
    10
}

fn default_client_buffer_chunks() -> usize {
    16
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Only origin URLs starting with this prefix are fetched.
    #[serde(default = "default_origin_prefix")]
    pub origin_prefix: String,
    /// Seconds to wait for the origin to start responding.
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout: u64,
    #[serde(default = "default_client_buffer_chunks")]
    pub client_buffer_chunks: usize,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            cache_dir: default_cache_dir(),
            origin_prefix: default_origin_prefix(),
            origin_timeout: default_origin_timeout(),
            client_buffer_chunks: default_client_buffer_chunks(),
            log: default_log_format(),
            metrics_listen: None,
        }
    }
}

impl Settings {
    /// Layers, lowest precedence first: built-in defaults, the config file,
    /// `PICTEE__*` variables, `PORT`, and finally `--port`.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = match cli.config_path() {
            Some(path) => {
                builder = builder.add_source(File::from(path.to_path_buf()).required(true));
                Some(path.to_path_buf())
            }
            None => {
                let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
                if candidate.exists() {
                    builder = builder.add_source(File::from(candidate.clone()).required(true));
                    Some(candidate)
                } else {
                    None
                }
            }
        };

        builder = builder.add_source(
            Environment::with_prefix("PICTEE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = config_path.as_deref() {
            settings.apply_base_dir(path);
        }
        if let Some(port) = port_from_env()? {
            settings.port = port;
        }
        if let Some(port) = cli.port {
            settings.port = port;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.port)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.origin_prefix.starts_with("https://") || self.origin_prefix.starts_with("http://"),
            "origin_prefix must be an absolute http(s) URL prefix (got {:?})",
            self.origin_prefix
        );
        ensure!(
            self.origin_prefix.len() > "https://".len()
                && !self.origin_prefix.ends_with("://"),
            "origin_prefix must name a host (got {:?})",
            self.origin_prefix
        );
        ensure!(
            self.origin_timeout > 0,
            "origin_timeout must be greater than 0 seconds (got {})",
            self.origin_timeout
        );
        ensure!(
            self.client_buffer_chunks > 0,
            "client_buffer_chunks must be greater than 0 (got {})",
            self.client_buffer_chunks
        );
        ensure!(
            !self.cache_dir.as_os_str().is_empty(),
            "cache_dir must not be empty"
        );
        Ok(())
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn port_from_env() -> Result<Option<u16>> {
    match std::env::var(PORT_ENV) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse::<u16>()
            .map(Some)
            .with_context(|| format!("invalid {PORT_ENV} value {value:?}")),
        Err(_) => Ok(None),
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
