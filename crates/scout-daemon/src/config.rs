//! Daemon configuration loaded from a YAML file.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! node that discovers peers by broadcast on the local subnet.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How a fresh node looks for an existing cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// UDP HELLO on the subnet broadcast address.
    #[default]
    Broadcast,
    /// Query a service directory for healthy peers.
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    /// Directory endpoint (e.g. `http://consul.service:8500`). Required in directory mode.
    pub join: Option<String>,
    /// Service name nodes register under.
    pub service_name: String,
    pub attempts: u32,
    pub backoff_ms: u64,
    /// How long a broadcasting node waits for a leader to answer.
    pub reply_window_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Broadcast,
            join: None,
            service_name: "scout-node".to_string(),
            attempts: 10,
            backoff_ms: 3000,
            reply_window_ms: 5000,
        }
    }
}

impl DiscoveryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn reply_window(&self) -> Duration {
        Duration::from_millis(self.reply_window_ms)
    }
}

/// Admin credentials for the data service sitting on top of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataServiceConfig {
    /// When false, joins skip the data-service step.
    pub enabled: bool,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub services: Vec<String>,
}

impl Default for DataServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            username: "Administrator".to_string(),
            password: String::new(),
            port: 8091,
            services: ["kv", "n1ql", "index", "fts"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub tick_interval_ms: u64,
    /// Follower resets once the leader has been silent this long.
    pub stale_after_ms: u64,
    /// Capacity of the gossip → reconciler event channel.
    pub event_buffer: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 3000,
            stale_after_ms: 10_000,
            event_buffer: 16,
        }
    }
}

impl ReconcilerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub indirect_probes: usize,
    pub suspicion_timeout_ms: u64,
    /// Dead or departed members are forgotten after this long.
    pub reap_after_ms: u64,
    pub join_timeout_ms: u64,
    /// How long the gossip layer waits for room in the event channel.
    pub event_send_timeout_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 1000,
            probe_timeout_ms: 500,
            indirect_probes: 3,
            suspicion_timeout_ms: 5000,
            reap_after_ms: 60_000,
            join_timeout_ms: 2000,
            event_send_timeout_ms: 1000,
        }
    }
}

impl GossipConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn event_send_timeout(&self) -> Duration {
        Duration::from_millis(self.event_send_timeout_ms)
    }
}

/// Timing of the consensus engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Upper bound on a single membership change.
    pub change_timeout_ms: u64,
    /// Upper bound on a leadership verification round.
    pub leader_check_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 250,
            election_timeout_min_ms: 1000,
            election_timeout_max_ms: 2000,
            change_timeout_ms: 10_000,
            leader_check_timeout_ms: 2000,
        }
    }
}

impl ConsensusConfig {
    pub fn change_timeout(&self) -> Duration {
        Duration::from_millis(self.change_timeout_ms)
    }

    pub fn leader_check_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_check_timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of durable consensus state
    pub data_dir: PathBuf,
    /// Gossip name; defaults to the hostname
    pub node_name: Option<String>,
    /// Address to advertise; defaults to the first non-loopback IPv4 of the host
    pub advertise_ip: Option<IpAddr>,
    /// Subnet for broadcast discovery; limited broadcast when unset
    pub network: Option<IpNet>,
    pub raft_port: u16,
    pub gossip_port: u16,
    pub broadcast_port: u16,
    pub health_port: u16,
    pub discovery: DiscoveryConfig,
    pub data_service: DataServiceConfig,
    pub reconciler: ReconcilerConfig,
    pub gossip: GossipConfig,
    pub consensus: ConsensusConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            node_name: None,
            advertise_ip: None,
            network: None,
            raft_port: 8300,
            gossip_port: 7946,
            broadcast_port: 1300,
            health_port: 8600,
            discovery: DiscoveryConfig::default(),
            data_service: DataServiceConfig::default(),
            reconciler: ReconcilerConfig::default(),
            gossip: GossipConfig::default(),
            consensus: ConsensusConfig::default(),
        }
    }
}

impl Config {
    /// Read and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not a map
        let config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.mode == DiscoveryMode::Directory && self.discovery.join.is_none() {
            return Err(ConfigError::Invalid(
                "discovery.join is required in directory mode".into(),
            ));
        }
        if self.discovery.attempts == 0 {
            return Err(ConfigError::Invalid(
                "discovery.attempts must be at least 1".into(),
            ));
        }
        if self.reconciler.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.event_buffer must be at least 1".into(),
            ));
        }
        if self.reconciler.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.tick_interval_ms must be positive".into(),
            ));
        }
        let consensus = &self.consensus;
        if consensus.heartbeat_interval_ms >= consensus.election_timeout_min_ms
            || consensus.election_timeout_min_ms >= consensus.election_timeout_max_ms
        {
            return Err(ConfigError::Invalid(
                "consensus timing must satisfy heartbeat < election_min < election_max".into(),
            ));
        }

        let ports = [
            ("raft_port", self.raft_port),
            ("gossip_port", self.gossip_port),
            ("broadcast_port", self.broadcast_port),
            ("health_port", self.health_port),
        ];
        let mut seen = HashSet::new();
        for (name, port) in ports {
            if !seen.insert(port) {
                return Err(ConfigError::Invalid(format!(
                    "{} {} collides with another port",
                    name, port
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.broadcast_port, 1300);
        assert_eq!(config.health_port, 8600);
        assert_eq!(config.discovery.mode, DiscoveryMode::Broadcast);
        assert_eq!(config.discovery.attempts, 10);
        assert_eq!(config.discovery.backoff(), Duration::from_secs(3));
        assert_eq!(config.reconciler.tick_interval(), Duration::from_secs(3));
        assert_eq!(config.reconciler.stale_after(), Duration::from_secs(10));
        assert_eq!(config.reconciler.event_buffer, 16);
        assert_eq!(config.data_service.services, vec!["kv", "n1ql", "index", "fts"]);
        assert_eq!(config.consensus.heartbeat_interval_ms, 250);
        assert_eq!(config.consensus.change_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
data_dir: /var/lib/scout
raft_port: 9300
network: 192.168.10.0/24
discovery:
  mode: directory
  join: http://consul:8500
  attempts: 4
data_service:
  username: admin
  password: secret
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/scout"));
        assert_eq!(config.raft_port, 9300);
        assert_eq!(config.network.unwrap().to_string(), "192.168.10.0/24");
        assert_eq!(config.discovery.mode, DiscoveryMode::Directory);
        assert_eq!(config.discovery.attempts, 4);
        // Untouched nested fields keep defaults
        assert_eq!(config.discovery.service_name, "scout-node");
        assert_eq!(config.data_service.port, 8091);
    }

    #[test]
    fn test_directory_mode_requires_join() {
        let result = Config::from_yaml("discovery:\n  mode: directory\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let result = Config::from_yaml("discovery:\n  attempts: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_port_collision_rejected() {
        let result = Config::from_yaml("raft_port: 1300\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_network_rejected() {
        let result = Config::from_yaml("network: not-a-cidr\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_election_window_must_exceed_heartbeat() {
        let yaml = "consensus:\n  heartbeat_interval_ms: 1500\n";
        let result = Config::from_yaml(yaml);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let yaml = "consensus:\n  election_timeout_min_ms: 3000\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/scout.yaml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
