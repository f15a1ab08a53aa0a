//! Forwarding rules for discovered endpoints on overlay backends

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collaborators::{BoxFuture, Orchestrator, SupplementaryRules};
use crate::error::SourceError;
use crate::model::{Chain, PortSpec, Rule};
use crate::settings::EngineSettings;
use crate::snapshot::ServiceEndpoint;
use crate::sources::ipv4_endpoint;

/// Overlay-to-bridge accept per endpoint; empty without an overlay interface
pub fn service_endpoint_rules(
    settings: &EngineSettings,
    endpoints: &BTreeMap<String, Vec<ServiceEndpoint>>,
) -> Vec<Rule> {
    let Some(overlay) = &settings.backend.overlay_interface else {
        return Vec::new();
    };

    endpoints
        .values()
        .flatten()
        .filter(ipv4_endpoint)
        .map(|endpoint| {
            Rule::accept(Chain::Forward)
                .protocol(endpoint.protocol)
                .to_ip(endpoint.ip)
                .port(PortSpec::Single(endpoint.port))
                .on_interface(overlay)
                .out_interface(&settings.bridge_interface)
                .comment(format!("Forward overlay traffic to {}", endpoint.application))
        })
        .collect()
}

/// Re-reads endpoints when a forward-chain job is applied
pub struct EndpointSupplement {
    settings: EngineSettings,
    orchestrator: Arc<dyn Orchestrator>,
}

impl EndpointSupplement {
    pub fn new(settings: EngineSettings, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            settings,
            orchestrator,
        }
    }
}

impl SupplementaryRules for EndpointSupplement {
    fn rules_for(&self, chain: Chain) -> BoxFuture<'_, Result<Vec<Rule>, SourceError>> {
        Box::pin(async move {
            if chain != Chain::Forward || self.settings.backend.overlay_interface.is_none() {
                return Ok(Vec::new());
            }
            let endpoints = self.orchestrator.service_endpoints().await?;
            Ok(service_endpoint_rules(&self.settings, &endpoints))
        })
    }
}
