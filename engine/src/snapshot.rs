//! Point-in-time inputs of one reconciliation pass

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::model::{Protocol, Role};

/// A cluster peer as reported by the membership collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    /// Address per network scope (e.g. "private", "public")
    pub addresses: BTreeMap<String, IpAddr>,
    pub role: Role,
}

/// Peer topology as seen from the local host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub peers: Vec<Peer>,
    pub local_role: Role,
    pub local_scope: String,
}

impl Topology {
    /// Peers are kept sorted by id so that providers see them in a stable order
    pub fn new(mut peers: Vec<Peer>, local_role: Role, local_scope: impl Into<String>) -> Self {
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            peers,
            local_role,
            local_scope: local_scope.into(),
        }
    }
}

/// Application known to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    #[serde(default)]
    pub discovery_port: Option<u16>,
}

/// Concrete ip:port instance backing an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub application: String,
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Applications and their endpoints, present only on backends that expose them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub applications: BTreeMap<String, Application>,
    pub endpoints: BTreeMap<String, Vec<ServiceEndpoint>>,
}

impl Discovery {
    pub fn endpoints_for(&self, application: &str) -> &[ServiceEndpoint] {
        self.endpoints
            .get(application)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Applications whose discovery port satisfies `predicate`, by name
    pub fn applications_with_discovery_port(
        &self,
        predicate: impl Fn(u16) -> bool,
    ) -> impl Iterator<Item = &Application> {
        self.applications
            .values()
            .filter(move |app| app.discovery_port.is_some_and(&predicate))
    }
}

/// Everything the providers need for one pass
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub topology: Topology,
    /// Raw policy feed payload; `None` when the key has never been published
    pub feed: Option<Vec<u8>>,
    pub discovery: Option<Discovery>,
}
