//! Seams to the outside world
//!
//! Every trait returns boxed futures so implementations can be held as
//! `Arc<dyn Trait>` and swapped for in-memory fakes in tests.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::error::{FilterError, SourceError};
use crate::model::{Chain, Role, Rule};
use crate::snapshot::{Application, Peer, ServiceEndpoint};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Cluster membership change notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    PeerAdded(String),
    PeerRemoved(String),
    /// Orchestrator asked every host to resynchronise
    FullResync,
}

/// Kind of a store subscription message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMessageKind {
    /// A matching key changed value
    Data,
    /// Subscription bookkeeping, carries no change
    Control,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub kind: StoreMessageKind,
    pub key: String,
}

/// Live peer topology and the local host's role
pub trait ClusterMembership: Send + Sync {
    fn peers(&self) -> BoxFuture<'_, Result<Vec<Peer>, SourceError>>;

    fn local_role(&self) -> BoxFuture<'_, Result<Role, SourceError>>;

    fn events(&self) -> EventStream<MembershipEvent>;
}

/// Distributed key/value store carrying the policy feed
pub trait PolicyStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, SourceError>>;

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), SourceError>>;

    fn subscribe(&self, pattern: &str) -> EventStream<StoreMessage>;
}

/// Orchestrator backend with service discovery
pub trait Orchestrator: Send + Sync {
    fn applications(&self) -> BoxFuture<'_, Result<BTreeMap<String, Application>, SourceError>>;

    fn service_endpoints(
        &self,
    ) -> BoxFuture<'_, Result<BTreeMap<String, Vec<ServiceEndpoint>>, SourceError>>;
}

/// Default action of a kernel chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPolicy {
    Allow,
    Drop,
}

/// The primitive that mutates the packet filter. Calls are never issued
/// concurrently by the engine.
pub trait PacketFilter: Send + Sync {
    fn create_chain<'a>(&'a self, chain: &'a str) -> BoxFuture<'a, Result<(), FilterError>>;

    fn flush_chain<'a>(&'a self, chain: &'a str) -> BoxFuture<'a, Result<(), FilterError>>;

    fn set_policy<'a>(
        &'a self,
        chain: &'a str,
        policy: ChainPolicy,
    ) -> BoxFuture<'a, Result<(), FilterError>>;

    /// Replace the chain's rules with `rules`, in order. All or nothing: on
    /// error the chain keeps the rules it had before the call.
    fn set_rules<'a>(&'a self, chain: &'a str, rules: &'a [Rule])
        -> BoxFuture<'a, Result<(), FilterError>>;

    fn append_rule<'a>(&'a self, chain: &'a str, rule: &'a Rule)
        -> BoxFuture<'a, Result<(), FilterError>>;
}

/// Rules that can only be computed when a job is applied
pub trait SupplementaryRules: Send + Sync {
    fn rules_for(&self, chain: Chain) -> BoxFuture<'_, Result<Vec<Rule>, SourceError>>;
}

/// Where the leader reads the policy feed it publishes into the store
pub trait FeedOrigin: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, SourceError>>;

    fn describe(&self) -> String;
}
