//! Per-chain protection status shared between the worker and the agent

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::model::Chain;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainStatus {
    /// Bootstrap completed and the kernel chain fails closed
    pub protected: bool,
    pub applies: u64,
    pub failures: u64,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<BTreeMap<Chain, ChainStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, chain: Chain) -> ChainStatus {
        self.inner.read().await.get(&chain).cloned().unwrap_or_default()
    }

    pub async fn snapshot(&self) -> BTreeMap<Chain, ChainStatus> {
        let statuses = self.inner.read().await;
        Chain::ALL
            .iter()
            .map(|chain| (*chain, statuses.get(chain).cloned().unwrap_or_default()))
            .collect()
    }

    pub async fn mark_protected(&self, chain: Chain, protected: bool) {
        let mut statuses = self.inner.write().await;
        statuses.entry(chain).or_default().protected = protected;
    }

    pub async fn record_applied(&self, chain: Chain) {
        let mut statuses = self.inner.write().await;
        let status = statuses.entry(chain).or_default();
        status.applies += 1;
        status.last_applied_at = Some(Utc::now());
        status.last_error = None;
    }

    pub async fn record_failure(&self, chain: Chain, error: impl ToString) {
        let mut statuses = self.inner.write().await;
        let status = statuses.entry(chain).or_default();
        status.failures += 1;
        status.last_error = Some(error.to_string());
    }
}
