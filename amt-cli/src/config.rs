//! Configuration file support for the AMT CLI tools

use amt_gateway::{GatewayConfig, MembershipConfig, QueryResponseMode, TunnelConfig};
use amt_protocol::message::AMT_PORT;
use amt_protocol::ReassemblyConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Relay to tunnel through
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay discovery address (anycast or unicast)
    pub address: IpAddr,
    /// UDP port of the relay
    #[serde(default = "default_relay_port")]
    pub port: u16,
}

fn default_relay_port() -> u16 {
    AMT_PORT
}

/// Channel to receive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Multicast group
    pub group: IpAddr,
    /// Source for source-specific reception
    pub source: Option<IpAddr>,
    /// Destination UDP port of the stream
    pub port: u16,
}

/// Handshake timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub discovery_interval_ms: u64,
    /// Unlimited when absent
    pub discovery_retries: Option<u32>,
    pub request_interval_ms: u64,
    pub request_retries: u32,
    pub receive_timeout_ms: u64,
}

impl Default for TunnelSection {
    fn default() -> Self {
        let defaults = TunnelConfig::default();
        TunnelSection {
            discovery_interval_ms: defaults.discovery_interval.as_millis() as u64,
            discovery_retries: defaults.discovery_retries,
            request_interval_ms: defaults.request_interval.as_millis() as u64,
            request_retries: defaults.request_retries,
            receive_timeout_ms: defaults.receive_timeout.as_millis() as u64,
        }
    }
}

/// Membership report behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipSection {
    pub robustness: u8,
    pub query_interval_secs: u64,
    pub unsolicited_report_interval_ms: u64,
    /// Delay query responses by a random fraction of the max response time
    pub randomized_responses: bool,
}

impl Default for MembershipSection {
    fn default() -> Self {
        let defaults = MembershipConfig::default();
        MembershipSection {
            robustness: defaults.robustness,
            query_interval_secs: defaults.query_interval.as_secs(),
            unsolicited_report_interval_ms: defaults.unsolicited_report_interval.as_millis()
                as u64,
            randomized_responses: defaults.response_mode == QueryResponseMode::Randomized,
        }
    }
}

/// Fragment reassembly limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblySection {
    pub max_cache_size: usize,
    pub pending_budget: usize,
    pub timeout_secs: u64,
}

impl Default for ReassemblySection {
    fn default() -> Self {
        let defaults = ReassemblyConfig::default();
        ReassemblySection {
            max_cache_size: defaults.max_cache_size,
            pending_budget: defaults.pending_budget,
            timeout_secs: defaults.timeout.as_secs(),
        }
    }
}

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub relay: Option<RelayConfig>,
    pub channel: Option<ChannelConfig>,
    /// Output destination ("-" for stdout, a file path, or udp://host:port)
    #[serde(default = "default_output")]
    pub output: String,
    /// Statistics interval in seconds; 0 disables
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub membership: MembershipSection,
    #[serde(default)]
    pub reassembly: ReassemblySection,
}

fn default_output() -> String {
    "-".to_string()
}

fn default_stats_interval() -> u64 {
    5
}

impl Default for CliConfig {
    fn default() -> Self {
        CliConfig {
            relay: None,
            channel: None,
            output: default_output(),
            stats_interval_secs: default_stats_interval(),
            tunnel: TunnelSection::default(),
            membership: MembershipSection::default(),
            reassembly: ReassemblySection::default(),
        }
    }
}

impl CliConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: CliConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.membership.robustness == 0 {
            return Err(ConfigError::Invalid("robustness must be at least 1".into()));
        }
        if self.reassembly.max_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "max_cache_size must be at least 1".into(),
            ));
        }
        if let Some(channel) = &self.channel {
            if !channel.group.is_multicast() {
                return Err(ConfigError::Invalid(format!(
                    "{} is not a multicast group",
                    channel.group
                )));
            }
        }
        Ok(())
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Gateway configuration for the core
    pub fn gateway_config(&self) -> GatewayConfig {
        let relay_port = self.relay.as_ref().map_or(AMT_PORT, |r| r.port);
        GatewayConfig {
            tunnel: TunnelConfig {
                relay_port,
                discovery_interval: Duration::from_millis(self.tunnel.discovery_interval_ms),
                discovery_retries: self.tunnel.discovery_retries,
                request_interval: Duration::from_millis(self.tunnel.request_interval_ms),
                request_retries: self.tunnel.request_retries,
                receive_timeout: Duration::from_millis(self.tunnel.receive_timeout_ms),
                ..TunnelConfig::default()
            },
            membership: MembershipConfig {
                robustness: self.membership.robustness,
                query_interval: Duration::from_secs(self.membership.query_interval_secs),
                unsolicited_report_interval: Duration::from_millis(
                    self.membership.unsolicited_report_interval_ms,
                ),
                response_mode: if self.membership.randomized_responses {
                    QueryResponseMode::Randomized
                } else {
                    QueryResponseMode::Immediate
                },
            },
            reassembly: ReassemblyConfig {
                max_cache_size: self.reassembly.max_cache_size,
                pending_budget: self.reassembly.pending_budget,
                timeout: Duration::from_secs(self.reassembly.timeout_secs),
            },
        }
    }

    /// Example configuration
    pub fn example() -> Self {
        CliConfig {
            relay: Some(RelayConfig {
                address: IpAddr::from([162, 250, 138, 201]),
                port: AMT_PORT,
            }),
            channel: Some(ChannelConfig {
                group: IpAddr::from([232, 162, 250, 140]),
                source: Some(IpAddr::from([162, 250, 137, 254])),
                port: 1234,
            }),
            ..CliConfig::default()
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
