//! Policy feed read from a local file on the leader

use std::io::ErrorKind;
use std::path::PathBuf;

use hostwall_engine::{BoxFuture, FeedOrigin, SourceError};

pub struct FileFeedOrigin {
    path: PathBuf,
}

impl FileFeedOrigin {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FeedOrigin for FileFeedOrigin {
    /// A missing file means nothing to publish
    fn load(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>, SourceError>> {
        Box::pin(async move {
            match tokio::fs::read(&self.path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(SourceError::FeedOrigin(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                ))),
            }
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
