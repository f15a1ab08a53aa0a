//! Fixed bootstrap policy: loopback, bridge, connection tracking and the
//! management ports, expanded once per trusted source network.

use std::collections::BTreeMap;

use crate::model::{Chain, ConnState, PortSpec, Protocol, Role, Rule};
use crate::settings::EngineSettings;

/// Static rules before role gating
fn templates(settings: &EngineSettings) -> Vec<Rule> {
    let mut rules = vec![
        Rule::accept(Chain::Input)
            .on_interface("lo")
            .comment("Accept all connections on loopback interface"),
        Rule::accept(Chain::Input)
            .on_interface(&settings.bridge_interface)
            .comment("Accept all connections on bridge interface"),
        Rule::accept(Chain::Input)
            .with_state(&[ConnState::Established, ConnState::Related])
            .comment("Accept all established and related connections"),
    ];

    for cidr in &settings.trusted_cidrs {
        for port in &settings.management_ports {
            rules.push(
                Rule::accept(Chain::Input)
                    .protocol(Protocol::Tcp)
                    .port(PortSpec::Single(*port))
                    .on_interface(&settings.private_interface)
                    .from_net(*cidr)
                    .comment(format!("Accept connections to management port {port} on private interface")),
            );
        }
        rules.push(
            Rule::accept(Chain::Input)
                .protocol(Protocol::Tcp)
                .port(PortSpec::Single(settings.api_port))
                .on_interface(&settings.private_interface)
                .from_net(*cidr)
                .only_for(Role::Leader)
                .comment("Accept connections to control-plane API on private interface"),
        );
    }

    rules.push(
        Rule::accept(Chain::Forward)
            .with_state(&[ConnState::Established, ConnState::Related])
            .comment("Accept all established and related forwarded connections"),
    );

    rules
}

/// Static rules for `role`, role restrictions consumed
pub fn static_rules(settings: &EngineSettings, role: Role) -> Vec<Rule> {
    templates(settings)
        .into_iter()
        .filter(|rule| rule.role_restriction.map_or(true, |wanted| wanted == role))
        .map(Rule::unrestricted)
        .collect()
}

/// Per-chain rules installed into the custom chains during bootstrap
pub fn initial_rules(settings: &EngineSettings, role: Role) -> BTreeMap<Chain, Vec<Rule>> {
    let mut by_chain: BTreeMap<Chain, Vec<Rule>> =
        Chain::ALL.iter().map(|chain| (*chain, Vec::new())).collect();
    for rule in static_rules(settings, role) {
        let rules = by_chain.entry(rule.chain).or_default();
        if !rules.contains(&rule) {
            rules.push(rule);
        }
    }
    by_chain
}
