//! hostwall engine: computes the host's desired firewall rule sets from
//! cluster state and commits them through a packet filter.

pub mod collaborators;
pub mod compiler;
pub mod error;
pub mod feed;
pub mod model;
pub mod publisher;
pub mod queue;
pub mod reconciler;
pub mod scheduler;
pub mod settings;
pub mod snapshot;
pub mod sources;
pub mod status;

pub use collaborators::{
    BoxFuture, ChainPolicy, ClusterMembership, EventStream, FeedOrigin, MembershipEvent,
    Orchestrator, PacketFilter, PolicyStore, StoreMessage, StoreMessageKind, SupplementaryRules,
};
pub use compiler::{compile, CompiledRules};
pub use error::{FeedEntryError, FilterError, FilterOp, ReconcileError, SourceError};
pub use model::{Chain, ConnState, Policy, PortSpec, Protocol, Role, Rule, RuleSet};
pub use publisher::FeedPublisher;
pub use queue::{run_worker, ApplyJob, ApplyQueue};
pub use reconciler::{ApplyOutcome, ChainReconciler, InitialRules};
pub use scheduler::{PassSummary, SyncScheduler, Trigger, TriggerHandle};
pub use settings::{BackendProfile, EngineSettings, NetworkScope, RetryPolicy};
pub use snapshot::{Application, Discovery, Peer, ServiceEndpoint, Snapshot, Topology};
pub use status::{ChainStatus, StatusBoard};
