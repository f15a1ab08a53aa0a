//! Leader-side publishing of the policy feed into the distributed store

use std::sync::Arc;
use tracing::{info, warn};

use crate::collaborators::{FeedOrigin, PolicyStore};
use crate::error::SourceError;

pub struct FeedPublisher {
    origin: Arc<dyn FeedOrigin>,
    store: Arc<dyn PolicyStore>,
    key: String,
    last_published: Option<serde_json::Value>,
}

impl FeedPublisher {
    pub fn new(origin: Arc<dyn FeedOrigin>, store: Arc<dyn PolicyStore>, key: impl Into<String>) -> Self {
        Self {
            origin,
            store,
            key: key.into(),
            last_published: None,
        }
    }

    /// Write the origin's feed to the store when its JSON value differs from
    /// what the store holds. Returns the bytes written, if any.
    pub async fn publish_if_changed(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        let Some(raw) = self.origin.load().await? else {
            return Ok(None);
        };

        let value: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(value @ serde_json::Value::Array(_)) => value,
            Ok(_) => {
                warn!("Policy feed at {} is not a list; not publishing", self.origin.describe());
                return Ok(None);
            }
            Err(e) => {
                warn!("Policy feed at {} is not valid JSON ({e}); not publishing", self.origin.describe());
                return Ok(None);
            }
        };

        if self.last_published.as_ref() == Some(&value) {
            return Ok(None);
        }

        let current = self
            .store
            .get(&self.key)
            .await?
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok());
        if current.as_ref() == Some(&value) {
            self.last_published = Some(value);
            return Ok(None);
        }

        let bytes = serde_json::to_vec(&value)
            .map_err(|e| SourceError::FeedOrigin(e.to_string()))?;
        self.store.set(&self.key, bytes.clone()).await?;
        info!("Published policy feed from {} to {}", self.origin.describe(), self.key);
        self.last_published = Some(value);
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BoxFuture, EventStream, StoreMessage};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedOrigin(Option<Vec<u8>>);

    impl FeedOrigin for FixedOrigin {
        fn load(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, SourceError>> {
            let payload = self.0.clone();
            Box::pin(async move { Ok(payload) })
        }

        fn describe(&self) -> String {
            "fixed".into()
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        values: Mutex<HashMap<String, Vec<u8>>>,
        writes: Mutex<usize>,
    }

    impl PolicyStore for MemoryStore {
        fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, SourceError>> {
            let value = self.values.lock().unwrap().get(key).cloned();
            Box::pin(async move { Ok(value) })
        }

        fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), SourceError>> {
            self.values.lock().unwrap().insert(key.to_string(), value);
            *self.writes.lock().unwrap() += 1;
            Box::pin(async { Ok(()) })
        }

        fn subscribe(&self, _pattern: &str) -> EventStream<StoreMessage> {
            Box::pin(tokio_stream::empty())
        }
    }

    #[tokio::test]
    async fn test_publishes_once() {
        let store = Arc::new(MemoryStore::default());
        let origin = Arc::new(FixedOrigin(Some(br#"[{"port": "22"}]"#.to_vec())));
        let mut publisher = FeedPublisher::new(origin, store.clone(), "feed");

        assert!(publisher.publish_if_changed().await.unwrap().is_some());
        assert!(publisher.publish_if_changed().await.unwrap().is_none());
        assert_eq!(*store.writes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_equal_store_value_is_not_rewritten() {
        let store = Arc::new(MemoryStore::default());
        store
            .values
            .lock()
            .unwrap()
            .insert("feed".into(), br#"[ {"port":"22"} ]"#.to_vec());
        let origin = Arc::new(FixedOrigin(Some(br#"[{"port": "22"}]"#.to_vec())));
        let mut publisher = FeedPublisher::new(origin, store.clone(), "feed");

        assert!(publisher.publish_if_changed().await.unwrap().is_none());
        assert_eq!(*store.writes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_non_list() {
        let store = Arc::new(MemoryStore::default());
        let origin = Arc::new(FixedOrigin(Some(br#"{"port": "22"}"#.to_vec())));
        let mut publisher = FeedPublisher::new(origin, store.clone(), "feed");
        assert!(publisher.publish_if_changed().await.unwrap().is_none());
        assert_eq!(*store.writes.lock().unwrap(), 0);
    }
}
