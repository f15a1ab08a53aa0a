//! Policy feed decoding
//!
//! The feed is a JSON array stored in the distributed store. Each element is
//! decoded on its own so one bad entry never hides the others.

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::FeedEntryError;
use crate::model::{host_net, is_valid_interface_name, PortSpec, Protocol, Role};

/// Which hosts a `host` entry targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    Leader,
    Follower,
    All,
}

impl HostMode {
    pub fn applies_to(self, role: Role) -> bool {
        match (self, role) {
            (HostMode::All, _) => true,
            (HostMode::Leader, Role::Leader) => true,
            (HostMode::Follower, Role::Follower) => true,
            (HostMode::Leader, Role::Follower) | (HostMode::Follower, Role::Leader) => false,
        }
    }
}

/// What a feed entry applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedTarget {
    Host(HostMode),
    Application(String),
}

/// A decoded, validated policy feed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyFeedEntry {
    pub target: FeedTarget,
    pub port: PortSpec,
    pub protocol: Protocol,
    /// `None` means any source
    pub source: Option<IpNet>,
    pub interface: Option<String>,
    pub description: Option<String>,
}

impl PolicyFeedEntry {
    pub fn comment(&self) -> String {
        self.description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| "policy feed rule".to_string())
    }
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "type", default = "default_entry_type")]
    kind: String,
    #[serde(default)]
    host: Option<RawHost>,
    #[serde(default)]
    application: Option<String>,
    port: RawPort,
    #[serde(default = "default_protocol")]
    protocol: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    interface: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct RawHost {
    #[serde(rename = "type", default = "default_host_selector")]
    kind: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u16),
    Text(String),
}

fn default_entry_type() -> String { "host".into() }
fn default_protocol() -> String { "tcp".into() }
fn default_host_selector() -> String { "mode".into() }

impl TryFrom<RawEntry> for PolicyFeedEntry {
    type Error = FeedEntryError;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        let target = match raw.kind.as_str() {
            "host" => FeedTarget::Host(parse_host_mode(raw.host.as_ref())?),
            "application" => match raw.application {
                Some(name) if !name.trim().is_empty() => FeedTarget::Application(name),
                _ => {
                    return Err(FeedEntryError::Malformed(
                        "application entry without application name".into(),
                    ))
                }
            },
            other => return Err(FeedEntryError::UnsupportedType(other.to_string())),
        };

        let port = match raw.port {
            RawPort::Number(p) => PortSpec::Single(p),
            RawPort::Text(text) => text.parse().map_err(FeedEntryError::InvalidPort)?,
        };
        let protocol = raw
            .protocol
            .parse()
            .map_err(FeedEntryError::InvalidProtocol)?;

        let source = match raw.source.as_deref().map(str::trim) {
            None | Some("") | Some("any") => None,
            Some(text) => {
                let net = parse_source(text)?;
                (net.prefix_len() != 0).then(|| net.trunc())
            }
        };

        let interface = match raw.interface {
            None => None,
            Some(name) if is_valid_interface_name(&name) => Some(name),
            Some(name) => {
                return Err(FeedEntryError::Malformed(format!(
                    "invalid interface name '{name}'"
                )))
            }
        };

        Ok(Self {
            target,
            port,
            protocol,
            source,
            interface,
            description: raw.description,
        })
    }
}

fn parse_host_mode(host: Option<&RawHost>) -> Result<HostMode, FeedEntryError> {
    let Some(host) = host else {
        return Ok(HostMode::All);
    };
    if host.kind != "mode" {
        return Err(FeedEntryError::UnsupportedHostSelector(host.kind.clone()));
    }
    match host.mode.as_deref() {
        Some("leader") => Ok(HostMode::Leader),
        Some("follower") => Ok(HostMode::Follower),
        Some("all") | None => Ok(HostMode::All),
        Some(other) => Err(FeedEntryError::UnsupportedHostSelector(other.to_string())),
    }
}

/// Bare addresses are accepted as host networks. Only IPv4 sources are
/// enforceable by the packet filter.
fn parse_source(text: &str) -> Result<IpNet, FeedEntryError> {
    text.parse::<IpNet>()
        .or_else(|_| text.parse().map(host_net))
        .ok()
        .filter(|net| matches!(net, IpNet::V4(_)))
        .ok_or_else(|| FeedEntryError::InvalidSource(text.to_string()))
}

/// Decode a feed payload into per-entry results
pub fn parse_feed(payload: &[u8]) -> Result<Vec<Result<PolicyFeedEntry, FeedEntryError>>, FeedEntryError> {
    let values: Vec<serde_json::Value> =
        serde_json::from_slice(payload).map_err(|e| FeedEntryError::Document(e.to_string()))?;

    Ok(values
        .into_iter()
        .map(|value| {
            serde_json::from_value::<RawEntry>(value)
                .map_err(|e| FeedEntryError::Malformed(e.to_string()))
                .and_then(PolicyFeedEntry::try_from)
        })
        .collect())
}
