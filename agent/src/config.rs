//! hostwall agent configuration loading and parsing

use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hostwall_engine::{BackendProfile, EngineSettings, NetworkScope, PortSpec, RetryPolicy};
use hostwall_engine::model::is_valid_interface_name;
use hostwall_engine::settings::default_trusted_cidrs;

const DEFAULT_CONFIG_PATH: &str = "/etc/hostwall/config.toml";
const CONFIG_ENV: &str = "HOSTWALL_CONFIG";

/// Root configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub trusted: TrustedConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,
}

#[derive(Debug, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Scope name whose peer addresses get forward-chain return rules
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_network_scope")]
    pub network_scope: String,
    #[serde(default = "default_private_interface")]
    pub private_interface: String,
    #[serde(default = "default_bridge_interface")]
    pub bridge_interface: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            scope: default_scope(),
            network_scope: default_network_scope(),
            private_interface: default_private_interface(),
            bridge_interface: default_bridge_interface(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_management_ports")]
    pub management_ports: Vec<u16>,
    #[serde(default = "default_discovery_min")]
    pub discovery_min: u16,
    #[serde(default = "default_discovery_max")]
    pub discovery_max: u16,
    #[serde(default = "default_container_min")]
    pub container_min: u16,
    #[serde(default = "default_container_max")]
    pub container_max: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            management_ports: default_management_ports(),
            discovery_min: default_discovery_min(),
            discovery_max: default_discovery_max(),
            container_min: default_container_min(),
            container_max: default_container_max(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_feed_key")]
    pub policy_feed_key: String,
    #[serde(default = "default_feed_pattern")]
    pub policy_feed_pattern: String,
    /// 0 disables the fallback rule
    #[serde(default = "default_fallback_ssh_port")]
    pub fallback_ssh_port: u16,
    #[serde(default = "default_status_interval")]
    pub status_interval_seconds: u64,
    /// Local policy feed the leader publishes into the store
    #[serde(default)]
    pub feed_file: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            policy_feed_key: default_feed_key(),
            policy_feed_pattern: default_feed_pattern(),
            fallback_ssh_port: default_fallback_ssh_port(),
            status_interval_seconds: default_status_interval(),
            feed_file: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_spacing")]
    pub spacing_seconds: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            spacing_seconds: default_spacing(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TrustedConfig {
    #[serde(default)]
    pub cidrs: Option<Vec<IpNet>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub service_discovery: bool,
    #[serde(default)]
    pub overlay_interface: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CollaboratorsConfig {
    #[serde(default = "default_host_api_url")]
    pub host_api_url: String,
    #[serde(default = "default_store_url")]
    pub store_url: String,
    #[serde(default = "default_iptables_binary")]
    pub iptables_binary: String,
    /// Installs whole chains in one transaction
    #[serde(default = "default_iptables_restore_binary")]
    pub iptables_restore_binary: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_watch_interval")]
    pub watch_interval_seconds: u64,
    /// Log iptables invocations instead of running them
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            host_api_url: default_host_api_url(),
            store_url: default_store_url(),
            iptables_binary: default_iptables_binary(),
            iptables_restore_binary: default_iptables_restore_binary(),
            request_timeout_seconds: default_request_timeout(),
            watch_interval_seconds: default_watch_interval(),
            dry_run: false,
        }
    }
}

fn default_log_level() -> String { "info".into() }
fn default_scope() -> String { "private".into() }
fn default_network_scope() -> String { "private".into() }
fn default_private_interface() -> String { "eth1".into() }
fn default_bridge_interface() -> String { "docker0".into() }
fn default_api_port() -> u16 { 8080 }
fn default_management_ports() -> Vec<u16> { vec![2666, 2777] }
fn default_discovery_min() -> u16 { 10000 }
fn default_discovery_max() -> u16 { 11023 }
fn default_container_min() -> u16 { 11024 }
fn default_container_max() -> u16 { 22047 }
fn default_interval() -> u64 { 15 }
fn default_feed_key() -> String { "hostwall::firewalls".into() }
fn default_feed_pattern() -> String { "hostwall::firewalls*".into() }
fn default_fallback_ssh_port() -> u16 { 22 }
fn default_status_interval() -> u64 { 300 }
fn default_attempts() -> u32 { 10 }
fn default_spacing() -> u64 { 30 }
fn default_host_api_url() -> String { "http://127.0.0.1:8080".into() }
fn default_store_url() -> String { "http://127.0.0.1:2666".into() }
fn default_iptables_binary() -> String { "iptables".into() }
fn default_iptables_restore_binary() -> String { "iptables-restore".into() }
fn default_request_timeout() -> u64 { 10 }
fn default_watch_interval() -> u64 { 5 }

impl AgentConfig {
    pub fn network_scope(&self) -> Result<NetworkScope> {
        match self.agent.network_scope.as_str() {
            "public" => Ok(NetworkScope::Public),
            "private" => Ok(NetworkScope::Private),
            other => bail!("Unknown network_scope '{other}' (expected \"public\" or \"private\")"),
        }
    }

    /// Engine settings derived from this configuration
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        if self.sync.interval_seconds == 0 {
            bail!("sync.interval_seconds must be at least 1");
        }
        let trusted_cidrs = match &self.trusted.cidrs {
            Some(cidrs) => cidrs.clone(),
            None => default_trusted_cidrs(self.network_scope()?),
        };
        if let Some(cidr) = trusted_cidrs.iter().find(|c| !matches!(c, IpNet::V4(_))) {
            bail!("trusted.cidrs: {cidr} is not an IPv4 network");
        }
        let interfaces = [
            ("agent.private_interface", Some(&self.agent.private_interface)),
            ("agent.bridge_interface", Some(&self.agent.bridge_interface)),
            ("backend.overlay_interface", self.backend.overlay_interface.as_ref()),
        ];
        for (field, name) in interfaces {
            if let Some(name) = name.filter(|n| !is_valid_interface_name(n)) {
                bail!("{field}: '{name}' is not a valid interface name");
            }
        }

        Ok(EngineSettings {
            api_port: self.ports.api_port,
            management_ports: self.ports.management_ports.clone(),
            discovery_ports: PortSpec::range(self.ports.discovery_min, self.ports.discovery_max),
            container_ports: PortSpec::range(self.ports.container_min, self.ports.container_max),
            scope: self.agent.scope.clone(),
            private_interface: self.agent.private_interface.clone(),
            bridge_interface: self.agent.bridge_interface.clone(),
            trusted_cidrs,
            backend: BackendProfile {
                service_discovery: self.backend.service_discovery,
                overlay_interface: self.backend.overlay_interface.clone(),
            },
            policy_feed_key: self.sync.policy_feed_key.clone(),
            policy_feed_pattern: self.sync.policy_feed_pattern.clone(),
            fallback_ssh_port: (self.sync.fallback_ssh_port != 0).then_some(self.sync.fallback_ssh_port),
            sync_interval: Duration::from_secs(self.sync.interval_seconds),
            bootstrap: RetryPolicy {
                attempts: self.bootstrap.attempts.max(1),
                spacing: Duration::from_secs(self.bootstrap.spacing_seconds),
            },
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborators.request_timeout_seconds)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.collaborators.watch_interval_seconds.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.sync.status_interval_seconds.max(1))
    }
}

/// Read and parse the configuration file at `path`
pub fn load_from(path: &Path) -> Result<AgentConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))
}

/// Where the loaded configuration came from; logged once tracing is up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at this path
    Defaults(PathBuf),
}

/// Load from `HOSTWALL_CONFIG` or the default path, falling back to defaults
/// when no file exists
pub fn load_config() -> Result<(AgentConfig, ConfigSource)> {
    let config_path = PathBuf::from(
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );

    if config_path.exists() {
        let config = load_from(&config_path)?;
        Ok((config, ConfigSource::File(config_path)))
    } else {
        Ok((AgentConfig::default(), ConfigSource::Defaults(config_path)))
    }
}
