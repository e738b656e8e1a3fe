use crate::race::DEFAULT_RACE_TIMEOUT;
use crate::upstream::{Upstream, DEFAULT_CONNECT_TIMEOUT};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Log verbosity for the crate's own targets
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "SOCKS5 proxy that races every request across several upstream SOCKS5 proxies",
    long_about = "parallel-socks accepts SOCKS5 clients and sends each connection through all \
configured upstream SOCKS5 proxies at once, keeping whichever answers first.\n\n\
Modes (picked per connection from its first bytes):\n\
- HTTP   : every request is raced and the first complete response is returned\n\
- opaque : one race at connect time, then the winning tunnel is relayed\n\n\
Without --listen-port the listeners are read from the JSON config file.\n"
)]
pub struct Cli {
    /// JSON config file (ignored in command line mode)
    #[arg(short, long, default_value = "config.json", value_name = "PATH")]
    pub config: PathBuf,

    /// IP address to bind in command line mode
    #[arg(short = 'a', long, default_value_t = IpAddr::V6(Ipv6Addr::LOCALHOST))]
    pub listen_address: IpAddr,

    /// Port to listen on; enables command line mode
    #[arg(short = 'p', long)]
    pub listen_port: Option<u16>,

    /// Upstream SOCKS5 proxy, repeat for each upstream (command line mode)
    #[arg(short, long = "socks", value_name = "HOST:PORT")]
    pub socks: Vec<String>,

    /// Log level (overrides the config file)
    #[arg(short, long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Seconds before a race gives up on every upstream
    #[arg(long, value_name = "SECS")]
    pub race_timeout: Option<u64>,

    /// Seconds allowed for the TCP connect to one upstream
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no listeners configured")]
    NoListeners,

    #[error("command line mode requires at least one --socks upstream")]
    NoUpstreamFlags,

    #[error("listener {index}: {reason}")]
    Listener { index: usize, reason: String },

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// JSON config file layout
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub log_level: Option<LogLevel>,
    #[serde(default)]
    pub race_timeout: Option<u64>,
    #[serde(default)]
    pub connect_timeout: Option<u64>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// One SOCKS5 listen address and the upstreams raced behind it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenerConfig {
    pub listen: String,
    #[serde(default)]
    pub socks: Vec<Upstream>,
}

impl ListenerConfig {
    fn validate(&self) -> Result<(), String> {
        check_host_port(&self.listen).map_err(|e| format!("listen {:?}: {}", self.listen, e))?;

        if self.socks.is_empty() {
            return Err("no upstream SOCKS5 proxies".to_string());
        }
        for upstream in &self.socks {
            check_host_port(&upstream.address)
                .map_err(|e| format!("upstream {:?}: {}", upstream.address, e))?;
        }
        Ok(())
    }
}

/// Checks `host:port` (IPv6 hosts bracketed) without resolving anything
fn check_host_port(addr: &str) -> Result<(), String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| "missing port".to_string())?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| "unterminated '[' in host".to_string())?,
        None if host.contains(':') => return Err("IPv6 host must be bracketed".to_string()),
        None => host,
    };
    if host.is_empty() {
        return Err("empty host".to_string());
    }

    port.parse::<u16>()
        .map_err(|_| format!("invalid port {:?}", port))?;
    Ok(())
}

/// Validated runtime configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub log_level: LogLevel,
    pub race_timeout: Duration,
    pub connect_timeout: Duration,
    pub listeners: Vec<ListenerConfig>,
}

impl ProxyConfig {
    /// Build the configuration from command line flags, reading the JSON
    /// file unless `--listen-port` selects command line mode
    pub fn from_cli(args: &Cli) -> Result<Self, ConfigError> {
        let file = match args.listen_port {
            Some(port) => {
                if args.socks.is_empty() {
                    return Err(ConfigError::NoUpstreamFlags);
                }
                FileConfig {
                    listeners: vec![ListenerConfig {
                        listen: SocketAddr::new(args.listen_address, port).to_string(),
                        socks: args.socks.iter().map(Upstream::new).collect(),
                    }],
                    ..FileConfig::default()
                }
            }
            None => FileConfig::load(&args.config)?,
        };

        Self::merge(args, file)
    }

    fn merge(args: &Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let race_timeout = args.race_timeout.or(file.race_timeout);
        let connect_timeout = args.connect_timeout.or(file.connect_timeout);

        let config = ProxyConfig {
            log_level: args.log_level.or(file.log_level).unwrap_or_default(),
            race_timeout: seconds(race_timeout, DEFAULT_RACE_TIMEOUT, "race_timeout")?,
            connect_timeout: seconds(connect_timeout, DEFAULT_CONNECT_TIMEOUT, "connect_timeout")?,
            listeners: file.listeners,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }
        for (index, listener) in self.listeners.iter().enumerate() {
            listener
                .validate()
                .map_err(|reason| ConfigError::Listener { index, reason })?;
        }
        Ok(())
    }
}

fn seconds(
    value: Option<u64>,
    default: Duration,
    name: &'static str,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(0) => Err(ConfigError::ZeroTimeout(name)),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}
