//! HTTP client for the distributed key/value store

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use hostwall_engine::{BoxFuture, EventStream, PolicyStore, SourceError, StoreMessage, StoreMessageKind};

#[derive(Clone)]
pub struct KvStoreClient {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl KvStoreClient {
    pub fn new(base_url: &str, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
        }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{key}", self.base_url)
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, SourceError> {
        let url = self.key_url(key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::Store(format!("GET {url}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SourceError::Store(format!("GET {url}: {}", response.status())));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::Store(format!("GET {url}: {e}")))?;
        Ok(Some(body.to_vec()))
    }

    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), SourceError> {
        let url = self.key_url(key);
        let response = self
            .client
            .put(&url)
            .body(value)
            .send()
            .await
            .map_err(|e| SourceError::Store(format!("PUT {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(SourceError::Store(format!("PUT {url}: {}", response.status())));
        }
        Ok(())
    }

    /// Current values of every key under `prefix`
    async fn list(&self, prefix: &str) -> Result<BTreeMap<String, String>, SourceError> {
        let url = format!("{}/v1/kv", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("prefix", prefix)])
            .send()
            .await
            .map_err(|e| SourceError::Store(format!("GET {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(SourceError::Store(format!("GET {url}: {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| SourceError::Store(format!("GET {url}: invalid body: {e}")))
    }
}

/// Trailing `*` matches any suffix; otherwise the key must match exactly
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

/// Keys that were added, changed or removed between two listings
pub fn changed_keys(previous: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> Vec<String> {
    let mut keys: Vec<String> = current
        .iter()
        .filter(|(key, value)| previous.get(*key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    keys.extend(
        previous
            .keys()
            .filter(|key| !current.contains_key(*key))
            .cloned(),
    );
    keys.sort();
    keys
}

async fn poll(client: KvStoreClient, pattern: String, tx: mpsc::Sender<StoreMessage>) {
    let prefix = pattern.trim_end_matches('*').to_string();
    let mut known: Option<BTreeMap<String, String>> = None;
    let mut ticker = tokio::time::interval(client.poll_interval);

    loop {
        ticker.tick().await;

        let current: BTreeMap<String, String> = match client.list(&prefix).await {
            Ok(values) => values
                .into_iter()
                .filter(|(key, _)| matches_pattern(&pattern, key))
                .collect(),
            Err(e) => {
                warn!("Store subscription for {pattern}: {e}");
                continue;
            }
        };

        let messages: Vec<StoreMessage> = match &known {
            None => vec![StoreMessage {
                kind: StoreMessageKind::Control,
                key: pattern.clone(),
            }],
            Some(previous) => changed_keys(previous, &current)
                .into_iter()
                .map(|key| StoreMessage {
                    kind: StoreMessageKind::Data,
                    key,
                })
                .collect(),
        };
        known = Some(current);

        for message in messages {
            debug!(key = %message.key, "Store message {:?}", message.kind);
            if tx.send(message).await.is_err() {
                return;
            }
        }
    }
}

impl PolicyStore for KvStoreClient {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, SourceError>> {
        Box::pin(self.fetch(key))
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), SourceError>> {
        Box::pin(self.store(key, value))
    }

    fn subscribe(&self, pattern: &str) -> EventStream<StoreMessage> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(poll(self.clone(), pattern.to_string(), tx));
        Box::pin(ReceiverStream::new(rx))
    }
}
