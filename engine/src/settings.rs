//! Static engine settings, built once at startup by the agent

use ipnet::IpNet;
use std::time::Duration;

use crate::model::PortSpec;

/// Whether the host's network scope is reachable from the internet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkScope {
    Public,
    Private,
}

/// Trusted management sources when none are configured
pub fn default_trusted_cidrs(scope: NetworkScope) -> Vec<IpNet> {
    let cidrs: &[&str] = match scope {
        NetworkScope::Public => &["0.0.0.0/0"],
        NetworkScope::Private => &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"],
    };
    cidrs.iter().filter_map(|c| c.parse().ok()).collect()
}

/// Inbound/outbound NIC pair crossed by forwarded traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePair {
    pub inbound: String,
    pub outbound: String,
}

/// Capabilities of the orchestrator backend
#[derive(Debug, Clone, Default)]
pub struct BackendProfile {
    pub service_discovery: bool,
    pub overlay_interface: Option<String>,
}

impl BackendProfile {
    /// Discovery data is fetched when either expansion needs it
    pub fn needs_discovery(&self) -> bool {
        self.service_discovery || self.overlay_interface.is_some()
    }

    /// Pairings used for forward-chain endpoint rules
    pub fn interface_pairs(&self, private_interface: &str, bridge_interface: &str) -> Vec<InterfacePair> {
        let mut pairs = vec![InterfacePair {
            inbound: private_interface.to_string(),
            outbound: bridge_interface.to_string(),
        }];
        if let Some(overlay) = &self.overlay_interface {
            pairs.push(InterfacePair {
                inbound: overlay.clone(),
                outbound: bridge_interface.to_string(),
            });
        }
        pairs
    }
}

/// Bounded retry with fixed spacing
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub spacing: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            spacing: Duration::from_secs(30),
        }
    }
}

/// Everything the providers, reconciler and scheduler read but never change
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Control-plane API port, opened to peers on the leader
    pub api_port: u16,
    /// Host agent management ports on the private interface
    pub management_ports: Vec<u16>,
    pub discovery_ports: PortSpec,
    pub container_ports: PortSpec,
    /// Scope name whose peer addresses get forward-chain return rules
    pub scope: String,
    pub private_interface: String,
    pub bridge_interface: String,
    pub trusted_cidrs: Vec<IpNet>,
    pub backend: BackendProfile,
    pub policy_feed_key: String,
    pub policy_feed_pattern: String,
    /// Port opened from anywhere while no policy feed is usable
    pub fallback_ssh_port: Option<u16>,
    pub sync_interval: Duration,
    pub bootstrap: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            api_port: 8080,
            management_ports: vec![2666, 2777],
            discovery_ports: PortSpec::range(10000, 11023),
            container_ports: PortSpec::range(11024, 22047),
            scope: "private".to_string(),
            private_interface: "eth1".to_string(),
            bridge_interface: "docker0".to_string(),
            trusted_cidrs: default_trusted_cidrs(NetworkScope::Private),
            backend: BackendProfile::default(),
            policy_feed_key: "hostwall::firewalls".to_string(),
            policy_feed_pattern: "hostwall::firewalls*".to_string(),
            fallback_ssh_port: Some(22),
            sync_interval: Duration::from_secs(15),
            bootstrap: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_trusted_cidrs() {
        let public = default_trusted_cidrs(NetworkScope::Public);
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].prefix_len(), 0);

        let private = default_trusted_cidrs(NetworkScope::Private);
        assert_eq!(private.len(), 3);
        assert!(private.iter().any(|n| n.to_string() == "172.16.0.0/12"));
    }

    #[test]
    fn test_interface_pairs() {
        let plain = BackendProfile::default();
        assert_eq!(plain.interface_pairs("eth1", "docker0").len(), 1);
        assert!(!plain.needs_discovery());

        let overlay = BackendProfile {
            service_discovery: false,
            overlay_interface: Some("flannel.1".into()),
        };
        let pairs = overlay.interface_pairs("eth1", "docker0");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1].inbound, "flannel.1");
        assert_eq!(pairs[1].outbound, "docker0");
        assert!(overlay.needs_discovery());
    }

    #[test]
    fn test_default_bootstrap_budget() {
        let settings = EngineSettings::default();
        assert_eq!(settings.bootstrap.attempts, 10);
        assert_eq!(settings.bootstrap.spacing, Duration::from_secs(30));
        assert_eq!(settings.sync_interval, Duration::from_secs(15));
    }
}
