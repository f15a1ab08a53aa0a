//! Rule providers
//!
//! Every provider is a pure function of the pass snapshot and the static
//! settings. The compiler consumes their outputs in the order of
//! [`ProviderOutputs`] fields.

pub mod endpoints;
pub mod policy_feed;
pub mod static_rules;
pub mod topology;

pub use endpoints::{service_endpoint_rules, EndpointSupplement};
pub use policy_feed::policy_feed_rules;
pub use static_rules::{initial_rules, static_rules};
pub use topology::topology_rules;

use tracing::debug;

use crate::model::Rule;
use crate::settings::EngineSettings;
use crate::snapshot::{ServiceEndpoint, Snapshot};

/// The packet filter only enforces IPv4; other endpoints are left out
pub(crate) fn ipv4_endpoint(endpoint: &&ServiceEndpoint) -> bool {
    if endpoint.ip.is_ipv4() {
        return true;
    }
    debug!(
        application = %endpoint.application,
        "Skipping non-IPv4 endpoint {}:{}", endpoint.ip, endpoint.port
    );
    false
}

/// Provider outputs for one pass, in compiler priority order
#[derive(Debug, Clone, Default)]
pub struct ProviderOutputs {
    pub static_rules: Vec<Rule>,
    pub topology: Vec<Rule>,
    pub policy_feed: Vec<Rule>,
    pub service_endpoints: Vec<Rule>,
}

impl ProviderOutputs {
    /// All candidates in priority order
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.static_rules
            .iter()
            .chain(&self.topology)
            .chain(&self.policy_feed)
            .chain(&self.service_endpoints)
    }

    pub fn total(&self) -> usize {
        self.static_rules.len()
            + self.topology.len()
            + self.policy_feed.len()
            + self.service_endpoints.len()
    }
}

/// Run every provider over `snapshot`
pub fn collect(settings: &EngineSettings, snapshot: &Snapshot) -> ProviderOutputs {
    let role = snapshot.topology.local_role;
    let discovery = snapshot.discovery.as_ref();

    ProviderOutputs {
        static_rules: static_rules(settings, role),
        topology: topology_rules(settings, &snapshot.topology),
        policy_feed: policy_feed_rules(settings, role, snapshot.feed.as_deref(), discovery),
        service_endpoints: discovery
            .map(|d| service_endpoint_rules(settings, &d.endpoints))
            .unwrap_or_default(),
    }
}
