//! Rule model: the types every stage of the engine exchanges.
//!
//! A [`Rule`] is one packet-filter rule candidate. Equality deliberately ignores
//! the free-text comment, so two rules that only differ in their comment are
//! the same rule for de-duplication and for change detection.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::str::FromStr;

/// Logical chains managed by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    Input,
    Forward,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::Input, Chain::Forward];

    /// Built-in kernel chain that delegates to the custom chain
    pub fn kernel_chain(self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
        }
    }

    /// Custom chain owned by the agent
    pub fn custom_chain(self) -> &'static str {
        match self {
            Chain::Input => "AGENT-INPUT",
            Chain::Forward => "AGENT-FORWARD",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.custom_chain())
    }
}

/// Action taken by a matching rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Policy {
    Accept,
    Drop,
    Return,
    DelegateToChain(String),
}

impl Policy {
    /// Jump target as understood by the packet filter
    pub fn target(&self) -> &str {
        match self {
            Policy::Accept => "ACCEPT",
            Policy::Drop => "DROP",
            Policy::Return => "RETURN",
            Policy::DelegateToChain(name) => name,
        }
    }
}

/// Transport protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unsupported protocol '{other}'")),
        }
    }
}

/// Destination port: a single port or an inclusive range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

impl PortSpec {
    /// Build an inclusive range, collapsing `min == max` to a single port
    pub fn range(min: u16, max: u16) -> Self {
        if min == max {
            PortSpec::Single(min)
        } else {
            PortSpec::Range(min.min(max), min.max(max))
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        match *self {
            PortSpec::Single(p) => p == port,
            PortSpec::Range(min, max) => (min..=max).contains(&port),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(p) => write!(f, "{p}"),
            PortSpec::Range(min, max) => write!(f, "{min}:{max}"),
        }
    }
}

impl FromStr for PortSpec {
    type Err = String;

    /// Accepts `"22"`, `"8000:8010"` and `"8000-8010"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port '{s}'"))
        };

        match s.split_once([':', '-']) {
            Some((min, max)) => Ok(PortSpec::range(parse(min)?, parse(max)?)),
            None => Ok(PortSpec::Single(parse(s)?)),
        }
    }
}

/// Connection-tracking state matched by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnState {
    Established,
    Related,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Established => "ESTABLISHED",
            ConnState::Related => "RELATED",
        }
    }
}

/// Cluster role of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => f.write_str("leader"),
            Role::Follower => f.write_str("follower"),
        }
    }
}

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL)
pub const MAX_INTERFACE_NAME: usize = 15;

/// Whether `name` can be passed to the packet filter as an interface match
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME
        && name != "."
        && name != ".."
        && !name.chars().any(|c| c.is_whitespace() || c == '/' || c == ':' || c.is_control())
}

/// Network covering exactly one address (`/32` or `/128`)
pub fn host_net(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::from(v4)),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::from(v6)),
    }
}

/// One packet-filter rule candidate
#[derive(Debug, Clone)]
pub struct Rule {
    pub chain: Chain,
    pub policy: Policy,
    pub protocol: Option<Protocol>,
    pub source: Option<IpNet>,
    pub destination: Option<IpAddr>,
    pub destination_port: Option<PortSpec>,
    pub interface: Option<String>,
    pub destination_interface: Option<String>,
    pub state: BTreeSet<ConnState>,
    pub comment: String,
    /// Only honoured by the compiler; compiled rules never carry it.
    pub role_restriction: Option<Role>,
}

impl Rule {
    pub fn new(chain: Chain, policy: Policy) -> Self {
        Self {
            chain,
            policy,
            protocol: None,
            source: None,
            destination: None,
            destination_port: None,
            interface: None,
            destination_interface: None,
            state: BTreeSet::new(),
            comment: String::new(),
            role_restriction: None,
        }
    }

    pub fn accept(chain: Chain) -> Self {
        Self::new(chain, Policy::Accept)
    }

    /// The forward chain's unconditional last rule
    pub fn default_deny() -> Self {
        Self::new(Chain::Forward, Policy::Drop).comment("default deny")
    }

    /// Rule installed in the kernel chain that jumps to the agent's chain
    pub fn delegation(chain: Chain) -> Self {
        Self::new(chain, Policy::DelegateToChain(chain.custom_chain().to_string()))
            .comment(format!("delegate to {}", chain.custom_chain()))
    }

    pub fn is_default_deny(&self) -> bool {
        *self == Self::default_deny()
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Restrict the source network. `0.0.0.0/0` and `::/0` mean "any" and
    /// leave the rule unrestricted.
    pub fn from_net(mut self, net: IpNet) -> Self {
        self.source = if net.prefix_len() == 0 {
            None
        } else {
            Some(net.trunc())
        };
        self
    }

    pub fn from_ip(self, ip: IpAddr) -> Self {
        self.from_net(host_net(ip))
    }

    pub fn to_ip(mut self, ip: IpAddr) -> Self {
        self.destination = Some(ip);
        self
    }

    pub fn port(mut self, port: PortSpec) -> Self {
        self.destination_port = Some(port);
        self
    }

    pub fn on_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn out_interface(mut self, interface: impl Into<String>) -> Self {
        self.destination_interface = Some(interface.into());
        self
    }

    pub fn with_state(mut self, states: &[ConnState]) -> Self {
        self.state.extend(states.iter().copied());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn only_for(mut self, role: Role) -> Self {
        self.role_restriction = Some(role);
        self
    }

    /// Drop the role restriction, as the compiler does for every emitted rule
    pub fn unrestricted(mut self) -> Self {
        self.role_restriction = None;
        self
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain
            && self.policy == other.policy
            && self.protocol == other.protocol
            && self.source == other.source
            && self.destination == other.destination
            && self.destination_port == other.destination_port
            && self.interface == other.interface
            && self.destination_interface == other.destination_interface
            && self.state == other.state
            && self.role_restriction == other.role_restriction
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.chain.hash(state);
        self.policy.hash(state);
        self.protocol.hash(state);
        self.source.hash(state);
        self.destination.hash(state);
        self.destination_port.hash(state);
        self.interface.hash(state);
        self.destination_interface.hash(state);
        self.state.hash(state);
        self.role_restriction.hash(state);
    }
}

/// Ordered rules for one chain (first match wins)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    chain: Chain,
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            rules: Vec::new(),
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn last(&self) -> Option<&Rule> {
        self.rules.last()
    }

    pub fn contains(&self, rule: &Rule) -> bool {
        self.rules.contains(rule)
    }

    pub fn into_rules(self) -> Vec<Rule> {
        self.rules
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}
