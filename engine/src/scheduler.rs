//! Sync scheduler
//!
//! Funnels the polling interval, membership events and policy store
//! notifications into reconciliation passes. Passes run one at a time; any
//! triggers that arrive during a pass are coalesced into a single follow-up.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::{ClusterMembership, MembershipEvent, Orchestrator, PolicyStore, StoreMessageKind};
use crate::compiler::compile;
use crate::error::SourceError;
use crate::model::Role;
use crate::publisher::FeedPublisher;
use crate::queue::{ApplyJob, ApplyQueue};
use crate::settings::EngineSettings;
use crate::snapshot::{Discovery, Snapshot, Topology};
use crate::sources;

/// Pending triggers beyond this are dropped; a pass is already owed
const TRIGGER_BUFFER: usize = 64;

/// Why a pass was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Interval,
    Membership(MembershipEvent),
    PolicyChanged(String),
}

/// Cloneable handle used to request a pass
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<Trigger>,
}

impl TriggerHandle {
    /// Returns false when the trigger was dropped because passes are already pending
    pub fn fire(&self, trigger: Trigger) -> bool {
        self.tx.try_send(trigger).is_ok()
    }
}

/// What one pass produced
#[derive(Debug, Clone)]
pub struct PassSummary {
    pub pass_id: Uuid,
    pub role: Role,
    pub peers: usize,
    pub input_rules: usize,
    pub forward_rules: usize,
    /// Jobs that replaced one still waiting in the queue
    pub replaced: usize,
}

pub struct SyncScheduler {
    settings: EngineSettings,
    membership: Arc<dyn ClusterMembership>,
    store: Arc<dyn PolicyStore>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    publisher: Option<FeedPublisher>,
    queue: ApplyQueue,
    tx: mpsc::Sender<Trigger>,
    rx: mpsc::Receiver<Trigger>,
}

impl SyncScheduler {
    pub fn new(
        settings: EngineSettings,
        membership: Arc<dyn ClusterMembership>,
        store: Arc<dyn PolicyStore>,
        orchestrator: Option<Arc<dyn Orchestrator>>,
        queue: ApplyQueue,
    ) -> Self {
        let (tx, rx) = mpsc::channel(TRIGGER_BUFFER);
        Self {
            settings,
            membership,
            store,
            orchestrator,
            publisher: None,
            queue,
            tx,
            rx,
        }
    }

    /// Publish the feed from `publisher` on passes where this host leads
    pub fn with_publisher(mut self, publisher: FeedPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn trigger_handle(&self) -> TriggerHandle {
        TriggerHandle { tx: self.tx.clone() }
    }

    /// Forward membership events and store notifications as triggers
    pub fn spawn_event_forwarders(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut membership_events = self.membership.events();
        let membership_handle = self.trigger_handle();
        let membership_cancel = cancel.clone();
        let membership_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = membership_cancel.cancelled() => break,
                    event = membership_events.next() => match event {
                        Some(event) => {
                            debug!("Membership event: {event:?}");
                            membership_handle.fire(Trigger::Membership(event));
                        }
                        None => {
                            warn!("Membership event stream ended");
                            break;
                        }
                    },
                }
            }
        });

        let mut store_messages = self.store.subscribe(&self.settings.policy_feed_pattern);
        let store_handle = self.trigger_handle();
        let store_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = store_messages.next() => match message {
                        Some(message) if message.kind == StoreMessageKind::Data => {
                            debug!(key = %message.key, "Policy feed changed");
                            store_handle.fire(Trigger::PolicyChanged(message.key));
                        }
                        Some(_) => {}
                        None => {
                            warn!("Policy store subscription ended");
                            break;
                        }
                    },
                }
            }
        });

        vec![membership_task, store_task]
    }

    async fn fetch_discovery(&self) -> Result<Option<Discovery>, SourceError> {
        let Some(orchestrator) = self.orchestrator.as_ref() else {
            return Ok(None);
        };
        if !self.settings.backend.needs_discovery() {
            return Ok(None);
        }
        let (applications, endpoints) =
            tokio::try_join!(orchestrator.applications(), orchestrator.service_endpoints())?;
        Ok(Some(Discovery {
            applications,
            endpoints,
        }))
    }

    /// Read every input, compile and enqueue one job per chain. Any failed
    /// read abandons the pass before anything is enqueued.
    pub async fn run_pass(&mut self) -> Result<PassSummary, SourceError> {
        let pass_id = Uuid::new_v4();

        let (peers, role, mut feed, discovery) = tokio::try_join!(
            self.membership.peers(),
            self.membership.local_role(),
            self.store.get(&self.settings.policy_feed_key),
            self.fetch_discovery(),
        )?;

        if role == Role::Leader {
            if let Some(publisher) = self.publisher.as_mut() {
                match publisher.publish_if_changed().await {
                    Ok(Some(published)) => feed = Some(published),
                    Ok(None) => {}
                    Err(e) => warn!(pass = %pass_id, "Policy feed not published: {e}"),
                }
            }
        }

        let snapshot = Snapshot {
            topology: Topology::new(peers, role, self.settings.scope.clone()),
            feed,
            discovery,
        };
        let outputs = sources::collect(&self.settings, &snapshot);
        let compiled = compile(role, &outputs);

        let input_rules = compiled.input.len();
        let forward_rules = compiled.forward.len();
        let mut replaced = 0;
        for rules in compiled.into_sets() {
            if self.queue.enqueue(ApplyJob::new(rules, role, pass_id)).await {
                replaced += 1;
            }
        }

        Ok(PassSummary {
            pass_id,
            role,
            peers: snapshot.topology.peers.len(),
            input_rules,
            forward_rules,
            replaced,
        })
    }

    /// Drain triggers queued while the last pass ran
    fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Run passes until cancelled. The first pass starts immediately and the
    /// interval is rearmed after each pass has been dispatched.
    pub async fn run(mut self, cancel: CancellationToken) {
        let interval = self.settings.sync_interval;
        let mut next_tick = Instant::now();

        loop {
            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(next_tick) => Trigger::Interval,
                Some(trigger) = self.rx.recv() => trigger,
            };

            let coalesced = self.drain_pending();
            if coalesced > 0 {
                debug!("Coalesced {coalesced} pending trigger(s) into one pass");
            }

            match self.run_pass().await {
                Ok(summary) => info!(
                    pass = %summary.pass_id,
                    role = %summary.role,
                    "Pass dispatched ({trigger:?}): {} peer(s), {} input rule(s), {} forward rule(s)",
                    summary.peers,
                    summary.input_rules,
                    summary.forward_rules
                ),
                Err(e) => warn!("Pass abandoned ({trigger:?}): {e}"),
            }

            next_tick = Instant::now() + interval;
        }

        info!("Sync scheduler stopped");
    }
}
