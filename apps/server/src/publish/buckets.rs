use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWrite;
use webhook_tunnel_common::Result;

/// Sink for one body blob
pub type BlobWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Blob storage for request and response bodies. Writers are opened lazily,
/// only when the corresponding direction actually carries bytes.
#[async_trait]
pub trait Buckets: Send + Sync {
    async fn open_request_writer(&self, request_id: &str) -> Result<BlobWriter>;

    async fn open_response_writer(&self, request_id: &str) -> Result<BlobWriter>;
}

/// Filesystem buckets: one directory per request below the data folder,
/// holding `request.blob` and `response.blob`.
pub struct FsBuckets {
    root: PathBuf,
}

impl FsBuckets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn open(&self, request_id: &str, name: &str) -> Result<BlobWriter> {
        let dir = self.root.join(request_id);
        fs::create_dir_all(&dir).await?;

        let file = fs::File::create(dir.join(name)).await?;
        Ok(Box::new(file))
    }
}

#[async_trait]
impl Buckets for FsBuckets {
    async fn open_request_writer(&self, request_id: &str) -> Result<BlobWriter> {
        self.open(request_id, "request.blob").await
    }

    async fn open_response_writer(&self, request_id: &str) -> Result<BlobWriter> {
        self.open(request_id, "response.blob").await
    }
}
