//! HTTP client for the local host agent API
//!
//! Serves cluster membership and, on backends that expose them, the
//! orchestrator's applications and service endpoints.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use hostwall_engine::{
    Application, BoxFuture, ClusterMembership, EventStream, MembershipEvent, Orchestrator, Peer,
    Role, ServiceEndpoint, SourceError,
};

/// `GET /v1/cluster/self`
#[derive(Debug, Clone, Deserialize)]
struct SelfInfo {
    role: Role,
    /// Bumped by the orchestrator to ask every host for a full resync
    #[serde(default)]
    sync_generation: u64,
}

#[derive(Clone)]
pub struct HostApiClient {
    client: reqwest::Client,
    base_url: String,
    watch_interval: Duration,
}

impl HostApiClient {
    pub fn new(base_url: &str, timeout: Duration, watch_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            watch_interval,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, String> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("GET {url}: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("GET {url}: {status}: {body}"));
        }
        response
            .json()
            .await
            .map_err(|e| format!("GET {url}: invalid body: {e}"))
    }

    async fn self_info(&self) -> Result<SelfInfo, SourceError> {
        self.get_json("/v1/cluster/self")
            .await
            .map_err(SourceError::Membership)
    }

    async fn fetch_peers(&self) -> Result<Vec<Peer>, SourceError> {
        self.get_json("/v1/cluster/peers")
            .await
            .map_err(SourceError::Membership)
    }
}

/// Events turning the `previous` peer ids into `current`
pub fn diff_peers(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> Vec<MembershipEvent> {
    let added = current
        .difference(previous)
        .map(|id| MembershipEvent::PeerAdded(id.clone()));
    let removed = previous
        .difference(current)
        .map(|id| MembershipEvent::PeerRemoved(id.clone()));
    added.chain(removed).collect()
}

fn peer_ids(peers: &[Peer]) -> BTreeSet<String> {
    peers.iter().map(|p| p.id.clone()).collect()
}

/// Poll the API and emit membership events until the receiver goes away
async fn watch(client: HostApiClient, tx: mpsc::Sender<MembershipEvent>) {
    let mut known: Option<BTreeSet<String>> = None;
    let mut generation: Option<u64> = None;
    let mut ticker = tokio::time::interval(client.watch_interval);

    loop {
        ticker.tick().await;

        let mut events = Vec::new();
        match client.fetch_peers().await {
            Ok(peers) => {
                let current = peer_ids(&peers);
                if let Some(previous) = &known {
                    events.extend(diff_peers(previous, &current));
                }
                known = Some(current);
            }
            Err(e) => warn!("Membership watch: {e}"),
        }
        match client.self_info().await {
            Ok(info) => {
                if generation.is_some_and(|seen| info.sync_generation > seen) {
                    events.push(MembershipEvent::FullResync);
                }
                generation = Some(info.sync_generation);
            }
            Err(e) => warn!("Membership watch: {e}"),
        }

        for event in events {
            debug!("Membership change: {event:?}");
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

impl ClusterMembership for HostApiClient {
    fn peers(&self) -> BoxFuture<'_, Result<Vec<Peer>, SourceError>> {
        Box::pin(self.fetch_peers())
    }

    fn local_role(&self) -> BoxFuture<'_, Result<Role, SourceError>> {
        Box::pin(async move { Ok(self.self_info().await?.role) })
    }

    fn events(&self) -> EventStream<MembershipEvent> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(watch(self.clone(), tx));
        Box::pin(ReceiverStream::new(rx))
    }
}

impl Orchestrator for HostApiClient {
    fn applications(&self) -> BoxFuture<'_, Result<BTreeMap<String, Application>, SourceError>> {
        Box::pin(async move {
            let applications: Vec<Application> = self
                .get_json("/v1/applications")
                .await
                .map_err(SourceError::Orchestrator)?;
            Ok(applications
                .into_iter()
                .map(|app| (app.name.clone(), app))
                .collect())
        })
    }

    fn service_endpoints(
        &self,
    ) -> BoxFuture<'_, Result<BTreeMap<String, Vec<ServiceEndpoint>>, SourceError>> {
        Box::pin(async move {
            let endpoints: Vec<ServiceEndpoint> = self
                .get_json("/v1/endpoints")
                .await
                .map_err(SourceError::Orchestrator)?;
            Ok(group_endpoints(endpoints))
        })
    }
}

/// Endpoints by application, each list sorted by address then port
fn group_endpoints(endpoints: Vec<ServiceEndpoint>) -> BTreeMap<String, Vec<ServiceEndpoint>> {
    let mut grouped: BTreeMap<String, Vec<ServiceEndpoint>> = BTreeMap::new();
    for endpoint in endpoints {
        grouped
            .entry(endpoint.application.clone())
            .or_default()
            .push(endpoint);
    }
    for list in grouped.values_mut() {
        list.sort_by(|a, b| (a.ip, a.port).cmp(&(b.ip, b.port)));
    }
    grouped
}
