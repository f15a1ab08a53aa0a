//! Peer-derived rules

use tracing::debug;

use crate::model::{Chain, Policy, PortSpec, Protocol, Role, Rule};
use crate::settings::EngineSettings;
use crate::snapshot::Topology;

/// Rules admitting cluster peers, shaped by the local role
pub fn topology_rules(settings: &EngineSettings, topology: &Topology) -> Vec<Rule> {
    let mut rules = Vec::new();

    for peer in &topology.peers {
        for (scope, address) in &peer.addresses {
            if !address.is_ipv4() {
                debug!(peer = %peer.id, "Skipping non-IPv4 {scope} address {address}");
                continue;
            }
            match topology.local_role {
                Role::Leader => rules.push(
                    Rule::accept(Chain::Input)
                        .protocol(Protocol::Tcp)
                        .port(PortSpec::Single(settings.api_port))
                        .from_ip(*address)
                        .comment(format!("Accept control-plane API from peer {}", peer.id)),
                ),
                Role::Follower => {
                    rules.push(
                        Rule::accept(Chain::Input)
                            .protocol(Protocol::Tcp)
                            .port(settings.discovery_ports)
                            .from_ip(*address)
                            .comment(format!("Accept service discovery ports from peer {}", peer.id)),
                    );
                    rules.push(
                        Rule::accept(Chain::Input)
                            .protocol(Protocol::Tcp)
                            .port(settings.container_ports)
                            .from_ip(*address)
                            .comment(format!("Accept container ports from peer {}", peer.id)),
                    );
                    if *scope == topology.local_scope {
                        rules.push(
                            Rule::new(Chain::Forward, Policy::Return)
                                .from_ip(*address)
                                .on_interface(&settings.private_interface)
                                .comment(format!("Return forwarded traffic from peer {}", peer.id)),
                        );
                    }
                }
            }
        }
    }

    rules
}
