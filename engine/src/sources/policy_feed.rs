//! Rules published by the operator through the policy feed

use tracing::{debug, warn};

use crate::error::FeedEntryError;
use crate::feed::{parse_feed, FeedTarget, PolicyFeedEntry};
use crate::model::{Chain, PortSpec, Protocol, Role, Rule};
use crate::settings::{EngineSettings, InterfacePair};
use crate::snapshot::{Discovery, ServiceEndpoint};
use crate::sources::ipv4_endpoint;

/// Keeps the host administrable while no usable feed exists
fn fallback_rules(settings: &EngineSettings) -> Vec<Rule> {
    settings
        .fallback_ssh_port
        .map(|port| {
            Rule::accept(Chain::Input)
                .protocol(Protocol::Tcp)
                .port(PortSpec::Single(port))
                .comment("Accept ssh while no policy feed is published")
        })
        .into_iter()
        .collect()
}

/// Input accept per endpoint, plus a forward accept per interface pairing
fn endpoint_rules(
    entry: &PolicyFeedEntry,
    endpoints: &[ServiceEndpoint],
    pairs: &[InterfacePair],
) -> Vec<Rule> {
    let mut rules = Vec::new();
    for endpoint in endpoints.iter().filter(ipv4_endpoint) {
        let base = |chain| {
            let rule = Rule::accept(chain)
                .protocol(entry.protocol)
                .to_ip(endpoint.ip)
                .port(PortSpec::Single(endpoint.port))
                .comment(format!("{} ({})", entry.comment(), endpoint.application));
            match entry.source {
                Some(net) => rule.from_net(net),
                None => rule,
            }
        };

        rules.push(base(Chain::Input));
        for pair in pairs {
            rules.push(
                base(Chain::Forward)
                    .on_interface(&pair.inbound)
                    .out_interface(&pair.outbound),
            );
        }
    }
    rules
}

fn host_rule(entry: &PolicyFeedEntry) -> Rule {
    let mut rule = Rule::accept(Chain::Input)
        .protocol(entry.protocol)
        .port(entry.port)
        .comment(entry.comment());
    if let Some(net) = entry.source {
        rule = rule.from_net(net);
    }
    if let Some(interface) = &entry.interface {
        rule = rule.on_interface(interface);
    }
    rule
}

fn entry_rules(
    settings: &EngineSettings,
    role: Role,
    entry: &PolicyFeedEntry,
    discovery: Option<&Discovery>,
    pairs: &[InterfacePair],
) -> Result<Vec<Rule>, FeedEntryError> {
    match &entry.target {
        FeedTarget::Host(mode) => {
            if !mode.applies_to(role) {
                return Ok(Vec::new());
            }
            let mut rules = vec![host_rule(entry)];
            if let (true, Some(discovery)) = (settings.backend.service_discovery, discovery) {
                for app in discovery.applications_with_discovery_port(|p| entry.port.contains(p)) {
                    rules.extend(endpoint_rules(entry, discovery.endpoints_for(&app.name), pairs));
                }
            }
            Ok(rules)
        }
        FeedTarget::Application(name) => {
            if role != Role::Follower {
                return Ok(Vec::new());
            }
            let endpoints = discovery.map(|d| d.endpoints_for(name)).unwrap_or(&[]);
            if endpoints.is_empty() {
                return Err(FeedEntryError::UnresolvedApplication(name.clone()));
            }
            Ok(endpoint_rules(entry, endpoints, pairs))
        }
    }
}

/// Translate the raw feed payload into rule candidates for `role`
pub fn policy_feed_rules(
    settings: &EngineSettings,
    role: Role,
    feed: Option<&[u8]>,
    discovery: Option<&Discovery>,
) -> Vec<Rule> {
    let Some(payload) = feed else {
        warn!("Policy feed {} not published; using fallback rules", settings.policy_feed_key);
        return fallback_rules(settings);
    };

    let entries = match parse_feed(payload) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Policy feed {} unusable ({e}); using fallback rules", settings.policy_feed_key);
            return fallback_rules(settings);
        }
    };

    let pairs = settings
        .backend
        .interface_pairs(&settings.private_interface, &settings.bridge_interface);

    let mut rules = Vec::new();
    for (index, entry) in entries.into_iter().enumerate() {
        let result = entry.and_then(|entry| entry_rules(settings, role, &entry, discovery, &pairs));
        match result {
            Ok(entry_rules) => rules.extend(entry_rules),
            Err(e @ FeedEntryError::UnresolvedApplication(_)) => {
                debug!("Skipping policy feed entry {index}: {e}");
            }
            Err(e) => warn!("Dropping policy feed entry {index}: {e}"),
        }
    }
    rules
}
