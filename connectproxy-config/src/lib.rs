use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

/// Proxy configuration loaded from YAML.
///
/// This structure defines the listener addresses, timeout settings, metrics
/// endpoint, outbound connection preferences and traffic statistics options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// List of addresses to listen on (e.g., "0.0.0.0:8080", "[::]:8080")
    pub listen_addrs: Vec<String>,
    /// Timeout configuration for various operations
    pub timeouts: Timeouts,
    /// Prometheus metrics and admin endpoint configuration
    pub metrics: Metrics,
    /// Outbound (target-facing) connection preferences
    #[serde(default)]
    pub outbound: Option<Outbound>,
    /// Per-request traffic statistics settings
    #[serde(default)]
    pub stats: Option<Stats>,
}

/// Timeout settings for proxy operations (all values in seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish a target connection (per resolved address)
    pub connect: u64,
    /// Maximum time to receive the complete request head from a client
    pub request_head: u64,
    /// Maximum time a tunnel write may make no progress before the tunnel is
    /// torn down (default: 300)
    #[serde(default = "default_stalled_write")]
    pub stalled_write: u64,
}

fn default_stalled_write() -> u64 {
    300
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection and the admin endpoint
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9090")
    pub address: String,
}

/// Outbound connection preferences applied to every tunnel and forwarded request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outbound {
    /// Local address to bind outgoing sockets to
    #[serde(default)]
    pub local_address: Option<IpAddr>,
    /// Restrict resolved target addresses to this IP family (4 or 6)
    #[serde(default)]
    pub ip_family: Option<u8>,
}

/// Traffic statistics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    /// Capacity of the completed-request broadcast channel (default: 1024)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Log every completed request record at info level (default: true)
    #[serde(default = "default_log_completed")]
    pub log_completed: bool,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_log_completed() -> bool {
    true
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            log_completed: default_log_completed(),
        }
    }
}

impl Config {
    /// Loads and validates configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use connectproxy_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses and validates configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use connectproxy_config::Config;
    ///
    /// let yaml = r#"
    /// listen_addrs:
    ///   - "127.0.0.1:8080"
    /// timeouts:
    ///   connect: 10
    ///   request_head: 10
    /// metrics:
    ///   enabled: true
    ///   address: "127.0.0.1:9090"
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen_addrs[0], "127.0.0.1:8080");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let config: Config = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addrs.is_empty() {
            return Err("at least one listen address is required".to_string());
        }
        for addr in &self.listen_addrs {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(format!("invalid listen address: {}", addr));
            }
        }

        if let Some(outbound) = &self.outbound {
            match outbound.ip_family {
                None | Some(4) | Some(6) => {}
                Some(other) => return Err(format!("ip_family must be 4 or 6, got {}", other)),
            }
            if let (Some(local), Some(family)) = (outbound.local_address, outbound.ip_family) {
                let matches = match local {
                    IpAddr::V4(_) => family == 4,
                    IpAddr::V6(_) => family == 6,
                };
                if !matches {
                    return Err(format!(
                        "local_address {} does not belong to ip_family {}",
                        local, family
                    ));
                }
            }
        }

        if self.timeouts.stalled_write == 0 {
            return Err("timeouts.stalled_write must be greater than zero".to_string());
        }

        if let Some(stats) = &self.stats
            && stats.event_capacity == 0
        {
            return Err("stats.event_capacity must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Statistics settings, falling back to defaults when the section is absent.
    pub fn stats(&self) -> Stats {
        self.stats.clone().unwrap_or_default()
    }

    /// Outbound settings, falling back to defaults when the section is absent.
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone().unwrap_or_default()
    }
}
