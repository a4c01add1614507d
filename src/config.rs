//! portbridge configuration: deserialization and validation.

use std::time::Duration;

use serde::Deserialize;

use crate::allocator::{AllocationRequest, PortAllocator};
use crate::error::BridgeError;
use crate::lease::DEFAULT_LEASE_INTERVAL;
use crate::range::MAX_PORT;
use crate::relay::{DEFAULT_RELAY_PORT, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY, RelaySession};

/// Top-level configuration, parsed from `portbridge.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// `[allocator]` section.
///
/// Port lists are kept as raw integers so that out-of-range entries surface
/// as `InvalidConfig` from `validate()` rather than as a parse error.
#[derive(Debug, Clone, Deserialize)]
pub struct AllocatorConfig {
    /// Lease aging interval in milliseconds.
    #[serde(default = "default_lease_interval_ms")]
    pub lease_interval_ms: u64,
    /// Probe only this host instead of every local address.
    pub host: Option<String>,
    /// Preferred ports, tried in order before an OS-assigned port.
    #[serde(default)]
    pub ports: Vec<i64>,
    /// Ports never to hand out.
    #[serde(default)]
    pub exclude: Vec<i64>,
}

/// `[relay]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_host")]
    pub host: String,
    #[serde(default = "default_relay_port")]
    pub port: i64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_lease_interval_ms() -> u64 {
    DEFAULT_LEASE_INTERVAL.as_millis() as u64
}

fn default_relay_host() -> String {
    "127.0.0.1".to_string()
}

fn default_relay_port() -> i64 {
    DEFAULT_RELAY_PORT as i64
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY.as_millis() as u64
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            lease_interval_ms: default_lease_interval_ms(),
            host: None,
            ports: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn port_entry(section: &str, field: &str, value: i64, min: i64) -> crate::Result<u16> {
    if value < min || value > MAX_PORT as i64 {
        return Err(BridgeError::InvalidConfig(
            section.to_string(),
            format!(
                "{} entry {} must be between {} and {}",
                field, value, min, MAX_PORT
            ),
        ));
    }
    Ok(value as u16)
}

impl BridgeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: BridgeConfig = toml::from_str(content)
            .map_err(|e| BridgeError::InvalidConfig("toml".to_string(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config, failing fast before any port is probed.
    pub fn validate(&self) -> crate::Result<()> {
        let allocator = &self.allocator;

        if allocator.lease_interval_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "allocator".to_string(),
                "lease_interval_ms must be > 0".to_string(),
            ));
        }
        if let Some(host) = &allocator.host {
            if host.trim().is_empty() {
                return Err(BridgeError::InvalidConfig(
                    "allocator".to_string(),
                    "host must not be empty".to_string(),
                ));
            }
        }
        for &port in &allocator.ports {
            port_entry("allocator", "ports", port, 1)?;
        }
        for &port in &allocator.exclude {
            port_entry("allocator", "exclude", port, 0)?;
        }

        let relay = &self.relay;
        if relay.host.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "relay".to_string(),
                "host must not be empty".to_string(),
            ));
        }
        port_entry("relay", "port", relay.port, 1)?;

        Ok(())
    }

    /// The allocation request described by `[allocator]`.
    pub fn allocation_request(&self) -> crate::Result<AllocationRequest> {
        let allocator = &self.allocator;
        let ports = allocator
            .ports
            .iter()
            .map(|&p| port_entry("allocator", "ports", p, 1))
            .collect::<crate::Result<Vec<u16>>>()?;
        let exclude = allocator
            .exclude
            .iter()
            .map(|&p| port_entry("allocator", "exclude", p, 0))
            .collect::<crate::Result<Vec<u16>>>()?;

        let mut request = AllocationRequest::new().ports(ports).exclude(exclude);
        if let Some(host) = &allocator.host {
            request = request.host(host.clone());
        }
        Ok(request)
    }

    /// Lease aging interval from `[allocator]`.
    pub fn lease_interval(&self) -> Duration {
        Duration::from_millis(self.allocator.lease_interval_ms)
    }

    /// An allocator whose leases age on the `[allocator]` interval.
    pub fn port_allocator(&self) -> PortAllocator {
        PortAllocator::with_aging(self.lease_interval())
    }

    /// The relay session described by `[relay]`.
    pub fn relay_session(&self) -> crate::Result<RelaySession> {
        let relay = &self.relay;
        let port = port_entry("relay", "port", relay.port, 1)?;
        Ok(RelaySession::new(relay.host.clone(), port)
            .retries(relay.retries)
            .retry_delay(Duration::from_millis(relay.retry_delay_ms)))
    }
}
