//! In-memory fakes for every collaborator trait
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hostwall_engine::{
    Application, BoxFuture, ChainPolicy, ClusterMembership, EventStream, FeedOrigin, FilterError,
    FilterOp, MembershipEvent, Orchestrator, PacketFilter, Peer, PolicyStore, Role, Rule,
    ServiceEndpoint, SourceError, StoreMessage,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// One recorded packet-filter call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateChain(String),
    FlushChain(String),
    SetPolicy(String, ChainPolicy),
    SetRules(String, Vec<Rule>),
    AppendRule(String, Rule),
}

type FailPredicate = Box<dyn Fn(&Call) -> bool + Send + Sync>;

struct Failure {
    matches: FailPredicate,
    remaining: u32,
}

#[derive(Default)]
struct FilterState {
    chains: BTreeMap<String, Vec<Rule>>,
    policies: BTreeMap<String, ChainPolicy>,
    calls: Vec<Call>,
    failures: Vec<Failure>,
}

/// Packet filter that records every call and can be told to fail
pub struct FakeFilter {
    state: Mutex<FilterState>,
    set_rules_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFilter {
    pub fn new() -> Self {
        let mut state = FilterState::default();
        for kernel in ["INPUT", "FORWARD"] {
            state.chains.insert(kernel.to_string(), Vec::new());
            state.policies.insert(kernel.to_string(), ChainPolicy::Allow);
        }
        Self {
            state: Mutex::new(state),
            set_rules_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_set_rules_delay(mut self, delay: Duration) -> Self {
        self.set_rules_delay = delay;
        self
    }

    /// Fail the next `times` calls matching `matches`
    pub fn fail_when(&self, times: u32, matches: impl Fn(&Call) -> bool + Send + Sync + 'static) {
        self.state.lock().unwrap().failures.push(Failure {
            matches: Box::new(matches),
            remaining: times,
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn policy(&self, chain: &str) -> Option<ChainPolicy> {
        self.state.lock().unwrap().policies.get(chain).copied()
    }

    pub fn rules(&self, chain: &str) -> Vec<Rule> {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_rules_calls(&self, chain: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::SetRules(name, _) if name == chain))
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Record `call`; returns an error when an injected failure matches
    fn record(&self, call: Call, op: FilterOp, chain: &str) -> Result<(), FilterError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.clone());
        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && (f.matches)(&call))
        {
            failure.remaining -= 1;
            return Err(FilterError::new(op, chain, "injected failure"));
        }
        Ok(())
    }
}

impl PacketFilter for FakeFilter {
    fn create_chain<'a>(&'a self, chain: &'a str) -> BoxFuture<'a, Result<(), FilterError>> {
        Box::pin(async move {
            self.record(Call::CreateChain(chain.into()), FilterOp::CreateChain, chain)?;
            self.state
                .lock()
                .unwrap()
                .chains
                .insert(chain.to_string(), Vec::new());
            Ok(())
        })
    }

    fn flush_chain<'a>(&'a self, chain: &'a str) -> BoxFuture<'a, Result<(), FilterError>> {
        Box::pin(async move {
            self.record(Call::FlushChain(chain.into()), FilterOp::FlushChain, chain)?;
            let mut state = self.state.lock().unwrap();
            match state.chains.get_mut(chain) {
                Some(rules) => {
                    rules.clear();
                    Ok(())
                }
                None => Err(FilterError::new(FilterOp::FlushChain, chain, "no such chain")),
            }
        })
    }

    fn set_policy<'a>(
        &'a self,
        chain: &'a str,
        policy: ChainPolicy,
    ) -> BoxFuture<'a, Result<(), FilterError>> {
        Box::pin(async move {
            self.record(Call::SetPolicy(chain.into(), policy), FilterOp::SetPolicy, chain)?;
            self.state
                .lock()
                .unwrap()
                .policies
                .insert(chain.to_string(), policy);
            Ok(())
        })
    }

    fn set_rules<'a>(
        &'a self,
        chain: &'a str,
        rules: &'a [Rule],
    ) -> BoxFuture<'a, Result<(), FilterError>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.set_rules_delay.is_zero() {
                tokio::time::sleep(self.set_rules_delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.record(Call::SetRules(chain.into(), rules.to_vec()), FilterOp::SetRules, chain)?;
            self.state
                .lock()
                .unwrap()
                .chains
                .insert(chain.to_string(), rules.to_vec());
            Ok(())
        })
    }

    fn append_rule<'a>(
        &'a self,
        chain: &'a str,
        rule: &'a Rule,
    ) -> BoxFuture<'a, Result<(), FilterError>> {
        Box::pin(async move {
            self.record(Call::AppendRule(chain.into(), rule.clone()), FilterOp::AppendRule, chain)?;
            let mut state = self.state.lock().unwrap();
            match state.chains.get_mut(chain) {
                Some(rules) => {
                    rules.push(rule.clone());
                    Ok(())
                }
                None => Err(FilterError::new(FilterOp::AppendRule, chain, "no such chain")),
            }
        })
    }
}

pub struct FakeMembership {
    pub peers: Mutex<Vec<Peer>>,
    pub role: Mutex<Role>,
    pub fail: AtomicBool,
    /// Number of `peers()` calls, one per pass
    pub peer_lookups: AtomicUsize,
    lookup_delay: Duration,
    events_tx: mpsc::UnboundedSender<MembershipEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MembershipEvent>>>,
}

impl FakeMembership {
    pub fn new(role: Role, peers: Vec<Peer>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            peers: Mutex::new(peers),
            role: Mutex::new(role),
            fail: AtomicBool::new(false),
            peer_lookups: AtomicUsize::new(0),
            lookup_delay: Duration::ZERO,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Make every `peers()` call take `delay`, keeping passes in flight
    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = delay;
        self
    }

    pub fn emit(&self, event: MembershipEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl ClusterMembership for FakeMembership {
    fn peers(&self) -> BoxFuture<'_, Result<Vec<Peer>, SourceError>> {
        Box::pin(async move {
            self.peer_lookups.fetch_add(1, Ordering::SeqCst);
            if !self.lookup_delay.is_zero() {
                tokio::time::sleep(self.lookup_delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::Membership("injected failure".into()));
            }
            Ok(self.peers.lock().unwrap().clone())
        })
    }

    fn local_role(&self) -> BoxFuture<'_, Result<Role, SourceError>> {
        Box::pin(async move { Ok(*self.role.lock().unwrap()) })
    }

    fn events(&self) -> EventStream<MembershipEvent> {
        match self.events_rx.lock().unwrap().take() {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::pending()),
        }
    }
}

pub struct FakeStore {
    pub values: Mutex<HashMap<String, Vec<u8>>>,
    pub fail: AtomicBool,
    messages_tx: mpsc::UnboundedSender<StoreMessage>,
    messages_rx: Mutex<Option<mpsc::UnboundedReceiver<StoreMessage>>>,
}

impl FakeStore {
    pub fn new() -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        Self {
            values: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
            messages_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
        }
    }

    pub fn with_value(self, key: &str, value: &[u8]) -> Self {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        self
    }

    pub fn notify(&self, message: StoreMessage) {
        let _ = self.messages_tx.send(message);
    }
}

impl PolicyStore for FakeStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, SourceError>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::Store("injected failure".into()));
            }
            Ok(self.values.lock().unwrap().get(key).cloned())
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), SourceError>> {
        Box::pin(async move {
            self.values.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        })
    }

    fn subscribe(&self, _pattern: &str) -> EventStream<StoreMessage> {
        match self.messages_rx.lock().unwrap().take() {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(tokio_stream::pending()),
        }
    }
}

#[derive(Default)]
pub struct FakeOrchestrator {
    pub applications: Mutex<BTreeMap<String, Application>>,
    pub endpoints: Mutex<BTreeMap<String, Vec<ServiceEndpoint>>>,
    pub endpoint_lookups: AtomicUsize,
}

impl FakeOrchestrator {
    pub fn with_application(self, name: &str, discovery_port: Option<u16>) -> Self {
        self.applications.lock().unwrap().insert(
            name.to_string(),
            Application {
                name: name.to_string(),
                discovery_port,
            },
        );
        self
    }

    pub fn with_endpoint(self, application: &str, ip: &str, port: u16) -> Self {
        self.endpoints
            .lock()
            .unwrap()
            .entry(application.to_string())
            .or_default()
            .push(ServiceEndpoint {
                application: application.to_string(),
                ip: ip.parse().unwrap(),
                port,
                protocol: Default::default(),
            });
        self
    }
}

impl Orchestrator for FakeOrchestrator {
    fn applications(&self) -> BoxFuture<'_, Result<BTreeMap<String, Application>, SourceError>> {
        Box::pin(async move { Ok(self.applications.lock().unwrap().clone()) })
    }

    fn service_endpoints(
        &self,
    ) -> BoxFuture<'_, Result<BTreeMap<String, Vec<ServiceEndpoint>>, SourceError>> {
        Box::pin(async move {
            self.endpoint_lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.endpoints.lock().unwrap().clone())
        })
    }
}

pub struct FakeOrigin(pub Vec<u8>);

impl FeedOrigin for FakeOrigin {
    fn load(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, SourceError>> {
        Box::pin(async move { Ok(Some(self.0.clone())) })
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

pub fn peer(id: &str, addresses: &[(&str, &str)], role: Role) -> Peer {
    Peer {
        id: id.to_string(),
        addresses: addresses
            .iter()
            .map(|(scope, ip)| (scope.to_string(), ip.parse().unwrap()))
            .collect(),
        role,
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
