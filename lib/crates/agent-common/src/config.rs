use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::registry::ToolFamily;

/// Well-known local port the front-end connects to.
pub const DEFAULT_PORT: u16 = 13337;

/// Desktop Agent server configuration.
///
/// Loaded by the server binary from `DESKTOP_AGENT_*` environment variables;
/// every field has a default so an empty environment is valid.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentServerConfig {
    /// Listen address (default: 127.0.0.1:13337)
    /// ⚠️ SECURITY: MUST be loopback. [`Self::validate`] hard-fails on any
    /// other interface (CWE-1327).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Maximum simultaneously connected clients.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Largest accepted inbound WebSocket message.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Inbound messages allowed per connection within one window.
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: usize,

    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    /// Maximum run time for `recon` tools.
    #[serde(default = "default_recon_timeout_secs")]
    pub recon_timeout_secs: u64,

    /// Maximum run time for `deep_scan` tools.
    #[serde(default = "default_deep_scan_timeout_secs")]
    pub deep_scan_timeout_secs: u64,

    /// Wait between SIGTERM and SIGKILL when stopping a tool.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Output forwarded per scan before further lines are dropped.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Idle time between WebSocket keepalive pings.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// A client that has not answered a ping within this long is dropped.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT))
}

fn default_max_connections() -> usize {
    5
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}

fn default_rate_limit_requests() -> usize {
    10
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_recon_timeout_secs() -> u64 {
    300
}

fn default_deep_scan_timeout_secs() -> u64 {
    1800
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_ping_timeout_secs() -> u64 {
    10
}

impl Default for AgentServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            max_message_bytes: default_max_message_bytes(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            recon_timeout_secs: default_recon_timeout_secs(),
            deep_scan_timeout_secs: default_deep_scan_timeout_secs(),
            grace_period_secs: default_grace_period_secs(),
            max_output_bytes: default_max_output_bytes(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
        }
    }
}

impl AgentServerConfig {
    /// Reject configurations the server must not start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.listen_addr.ip().is_loopback() {
            return Err(ConfigError::NonLoopback(self.listen_addr));
        }
        let limits = [
            ("max_connections", self.max_connections as u64),
            ("max_message_bytes", self.max_message_bytes as u64),
            ("rate_limit_requests", self.rate_limit_requests as u64),
            ("rate_limit_window_secs", self.rate_limit_window_secs),
            ("recon_timeout_secs", self.recon_timeout_secs),
            ("deep_scan_timeout_secs", self.deep_scan_timeout_secs),
            ("max_output_bytes", self.max_output_bytes as u64),
            ("ping_interval_secs", self.ping_interval_secs),
            ("ping_timeout_secs", self.ping_timeout_secs),
        ];
        if let Some((name, _)) = limits.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue(name));
        }
        Ok(())
    }

    #[must_use]
    pub fn timeouts(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            recon: Duration::from_secs(self.recon_timeout_secs),
            deep_scan: Duration::from_secs(self.deep_scan_timeout_secs),
        }
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

/// Maximum run duration per tool family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub recon: Duration,
    pub deep_scan: Duration,
}

impl TimeoutPolicy {
    #[must_use]
    pub fn for_family(&self, family: ToolFamily) -> Duration {
        match family {
            ToolFamily::Recon => self.recon,
            ToolFamily::DeepScan => self.deep_scan,
        }
    }
}
