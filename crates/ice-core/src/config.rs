//! ICE agent configuration
//!
//! This module defines the agent configuration and a builder for it.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// ICE role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IceRole {
    /// Controlling agent (makes the nomination decision)
    Controlling,

    /// Controlled agent
    Controlled,
}

impl IceRole {
    /// The opposite role
    pub fn opposite(self) -> Self {
        match self {
            Self::Controlling => Self::Controlled,
            Self::Controlled => Self::Controlling,
        }
    }
}

impl std::fmt::Display for IceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controlling => write!(f, "controlling"),
            Self::Controlled => write!(f, "controlled"),
        }
    }
}

/// How the controlling agent nominates pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NominationMode {
    /// Check first, then nominate the best valid pair with one extra check
    #[default]
    Regular,

    /// Every check carries USE-CANDIDATE
    Aggressive,
}

/// TURN server used for relayed candidates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// Server address
    pub address: SocketAddr,
    /// Long-term credential username
    pub username: String,
    /// Long-term credential password
    pub password: String,
}

/// ICE agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN servers used for server reflexive candidates
    pub stun_servers: Vec<SocketAddr>,
    /// TURN servers used for relayed candidates
    pub turn_servers: Vec<TurnServerConfig>,
    /// Start in the controlling role
    pub controlling: bool,
    /// ICE-lite mode (host candidates only, never sends checks)
    pub lite: bool,
    /// Default number of components for new streams
    pub components: u16,
    /// Nomination mode used when controlling
    pub nomination: NominationMode,
    /// Local addresses to gather host candidates on. Empty means enumerate
    /// the host interfaces.
    pub host_addresses: Vec<IpAddr>,
    /// Gather on loopback interfaces
    pub include_loopback: bool,
    /// Gather on IPv6 interfaces
    pub enable_ipv6: bool,
    /// Inclusive local port range for host sockets
    pub port_range: Option<(u16, u16)>,
    /// Pacing interval between checks (Ta)
    pub check_interval_ms: u64,
    /// Initial retransmission timeout
    pub initial_rto_ms: u64,
    /// Upper bound for the retransmission timeout
    pub max_rto_ms: u64,
    /// Retransmissions before a transaction times out
    pub max_retransmits: u32,
    /// Upper bound on candidate gathering per component
    pub max_gathering_time_ms: u64,
    /// Time after the first valid pair after which the controlling agent
    /// nominates even if higher-priority pairs are still being checked
    pub nomination_timeout_ms: u64,
    /// Interval between keepalives on the selected pair
    pub keepalive_interval_ms: u64,
    /// SOFTWARE attribute value
    pub software: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            controlling: false,
            lite: false,
            components: 1,
            nomination: NominationMode::Regular,
            host_addresses: Vec::new(),
            include_loopback: false,
            enable_ipv6: false,
            port_range: None,
            check_interval_ms: 20,
            initial_rto_ms: 250,
            max_rto_ms: 3000,
            max_retransmits: 6,
            max_gathering_time_ms: 5000,
            nomination_timeout_ms: 1000,
            keepalive_interval_ms: 15000,
            software: Some(format!("rvoip-ice-core/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

impl IceConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.components == 0 || self.components > 256 {
            return Err(Error::InvalidConfig(format!(
                "component count must be within 1..=256, got {}",
                self.components
            )));
        }
        if self.lite && self.controlling {
            return Err(Error::InvalidConfig(
                "an ICE-lite agent cannot take the controlling role".to_string(),
            ));
        }
        if self.check_interval_ms == 0 {
            return Err(Error::InvalidConfig("check interval must be non-zero".to_string()));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(Error::InvalidConfig("keepalive interval must be non-zero".to_string()));
        }
        if self.initial_rto_ms == 0 || self.max_rto_ms < self.initial_rto_ms {
            return Err(Error::InvalidConfig(format!(
                "invalid retransmission timeouts: initial {}ms, max {}ms",
                self.initial_rto_ms, self.max_rto_ms
            )));
        }
        if let Some((low, high)) = self.port_range {
            if low == 0 || low > high {
                return Err(Error::InvalidConfig(format!(
                    "invalid port range {}-{}",
                    low, high
                )));
            }
        }
        for server in &self.turn_servers {
            if server.username.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} has no username",
                    server.address
                )));
            }
        }
        Ok(())
    }

    /// Initial role
    pub fn role(&self) -> IceRole {
        if self.controlling {
            IceRole::Controlling
        } else {
            IceRole::Controlled
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn initial_rto(&self) -> Duration {
        Duration::from_millis(self.initial_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.max_gathering_time_ms)
    }

    pub fn nomination_timeout(&self) -> Duration {
        Duration::from_millis(self.nomination_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Builder for IceConfig
#[derive(Debug, Clone)]
pub struct IceConfigBuilder {
    /// Configuration being built
    config: IceConfig,
}

impl IceConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: IceConfig::default(),
        }
    }

    /// Create a builder for a full agent that takes the controlling role
    pub fn controlling() -> Self {
        let mut builder = Self::new();
        builder.config.controlling = true;
        builder
    }

    /// Create a builder for an ICE-lite agent (always controlled)
    pub fn lite() -> Self {
        let mut builder = Self::new();
        builder.config.lite = true;
        builder.config.controlling = false;
        builder
    }

    /// Add a STUN server
    pub fn stun_server(mut self, addr: SocketAddr) -> Self {
        self.config.stun_servers.push(addr);
        self
    }

    /// Add a TURN server with long-term credentials
    pub fn turn_server(mut self, addr: SocketAddr, username: &str, password: &str) -> Self {
        self.config.turn_servers.push(TurnServerConfig {
            address: addr,
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Set the initial role
    pub fn controlling_role(mut self, controlling: bool) -> Self {
        self.config.controlling = controlling;
        self
    }

    /// Set the default component count for new streams
    pub fn components(mut self, components: u16) -> Self {
        self.config.components = components;
        self
    }

    /// Set the nomination mode
    pub fn nomination(mut self, mode: NominationMode) -> Self {
        self.config.nomination = mode;
        self
    }

    /// Restrict host candidates to the given address
    pub fn host_address(mut self, addr: IpAddr) -> Self {
        self.config.host_addresses.push(addr);
        self
    }

    /// Include loopback interfaces when enumerating
    pub fn include_loopback(mut self, include: bool) -> Self {
        self.config.include_loopback = include;
        self
    }

    /// Include IPv6 interfaces when enumerating
    pub fn enable_ipv6(mut self, enable: bool) -> Self {
        self.config.enable_ipv6 = enable;
        self
    }

    /// Bind host sockets within the inclusive port range
    pub fn port_range(mut self, low: u16, high: u16) -> Self {
        self.config.port_range = Some((low, high));
        self
    }

    /// Set the check pacing interval
    pub fn check_interval_ms(mut self, interval: u64) -> Self {
        self.config.check_interval_ms = interval;
        self
    }

    /// Set the retransmission schedule
    pub fn retransmission(mut self, initial_rto_ms: u64, max_rto_ms: u64, max_retransmits: u32) -> Self {
        self.config.initial_rto_ms = initial_rto_ms;
        self.config.max_rto_ms = max_rto_ms;
        self.config.max_retransmits = max_retransmits;
        self
    }

    /// Set the gathering timeout
    pub fn max_gathering_time_ms(mut self, timeout: u64) -> Self {
        self.config.max_gathering_time_ms = timeout;
        self
    }

    /// Set the nomination timeout
    pub fn nomination_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.nomination_timeout_ms = timeout;
        self
    }

    /// Set the keepalive interval
    pub fn keepalive_interval_ms(mut self, interval: u64) -> Self {
        self.config.keepalive_interval_ms = interval;
        self
    }

    /// Set or clear the SOFTWARE attribute
    pub fn software(mut self, software: Option<String>) -> Self {
        self.config.software = software;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<IceConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
