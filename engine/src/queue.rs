//! Apply queue and its single worker
//!
//! The queue holds at most one pending job per chain. A newer job for a chain
//! that is already queued replaces the older one in place, so a burst of passes
//! collapses into the latest rule set.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::model::{Chain, Role, RuleSet};
use crate::reconciler::{ApplyOutcome, ChainReconciler};

/// Compiled rules for one chain, tagged with the pass that produced them
#[derive(Debug, Clone)]
pub struct ApplyJob {
    pub chain: Chain,
    pub rules: RuleSet,
    /// Local role the pass compiled for
    pub role: Role,
    pub pass_id: Uuid,
}

impl ApplyJob {
    pub fn new(rules: RuleSet, role: Role, pass_id: Uuid) -> Self {
        Self {
            chain: rules.chain(),
            rules,
            role,
            pass_id,
        }
    }
}

#[derive(Default)]
struct Inner {
    jobs: Mutex<VecDeque<ApplyJob>>,
    ready: Notify,
}

#[derive(Clone, Default)]
pub struct ApplyQueue {
    inner: Arc<Inner>,
}

impl ApplyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job`; returns true when it replaced a pending job for its chain
    pub async fn enqueue(&self, job: ApplyJob) -> bool {
        let mut jobs = self.inner.jobs.lock().await;
        let replaced = match jobs.iter_mut().find(|pending| pending.chain == job.chain) {
            Some(pending) => {
                *pending = job;
                true
            }
            None => {
                jobs.push_back(job);
                false
            }
        };
        drop(jobs);
        self.inner.ready.notify_one();
        replaced
    }

    pub async fn len(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait for the next job; `None` once `cancel` fires
    pub async fn next_job(&self, cancel: &CancellationToken) -> Option<ApplyJob> {
        loop {
            if let Some(job) = self.inner.jobs.lock().await.pop_front() {
                return Some(job);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.inner.ready.notified() => {}
            }
        }
    }
}

/// The only task that writes to the packet filter. Bootstraps every chain,
/// then applies jobs in arrival order until cancelled.
pub async fn run_worker(mut reconciler: ChainReconciler, queue: ApplyQueue, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {
            info!("Apply worker cancelled during bootstrap");
            return;
        }
        _ = reconciler.bootstrap_all() => {}
    }

    while let Some(job) = queue.next_job(&cancel).await {
        match reconciler.apply(&job).await {
            Ok(ApplyOutcome::Applied { rules }) => {
                info!(chain = %job.chain, pass = %job.pass_id, rules, "Applied rule set");
            }
            Ok(ApplyOutcome::Unchanged) => {
                debug!(chain = %job.chain, pass = %job.pass_id, "Rule set unchanged, skipping write");
            }
            Err(e) => error!(chain = %e.chain(), pass = %job.pass_id, "{e}"),
        }
    }

    info!("Apply worker stopped");
}
