use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

use super::buckets::{BlobWriter, Buckets};
use super::messages::{HttpData, HttpError, HttpRequestStart, HttpResponseStart};
use super::request::{ORIGIN_RECORDER, RequestListener, TunneledRequest};
use super::status::Status;
use super::store::{ResponseSummary, Store};

enum RecorderEvent {
    RequestData(HttpData),
    ResponseStart(HttpResponseStart),
    ResponseData(HttpData),
    Error(HttpError),
    Complete(Status),
}

/// Passive listener that tees both bodies into blob storage and writes the
/// summary row. All I/O happens on a dedicated task so the request's
/// callbacks never block; failures are logged and swallowed, they must not
/// reach the other listeners.
pub struct Recorder {
    events: mpsc::UnboundedSender<RecorderEvent>,
}

impl Recorder {
    /// Attach a recorder to a freshly created request
    pub fn attach(request: &TunneledRequest, store: Arc<dyn Store>, buckets: Arc<dyn Buckets>) {
        let (events, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            request_id: request.request_id.clone(),
            endpoint: request.endpoint.clone(),
            request: request.request.clone(),
            store,
            buckets,
            request_size: 0,
            request_writer: None,
            response_size: 0,
            response_writer: None,
            response: None,
            error: None,
        };
        tokio::spawn(worker.run(rx));

        request.listen(ORIGIN_RECORDER, Box::new(Recorder { events }));
    }
}

impl RequestListener for Recorder {
    fn on_request_data(&mut self, msg: &HttpData) {
        let _ = self.events.send(RecorderEvent::RequestData(msg.clone()));
    }

    fn on_response_start(&mut self, msg: &HttpResponseStart) {
        let _ = self.events.send(RecorderEvent::ResponseStart(msg.clone()));
    }

    fn on_response_data(&mut self, msg: &HttpData) {
        let _ = self.events.send(RecorderEvent::ResponseData(msg.clone()));
    }

    fn on_error(&mut self, msg: &HttpError) {
        let _ = self.events.send(RecorderEvent::Error(msg.clone()));
    }

    fn on_complete(&mut self, status: Status) {
        let _ = self.events.send(RecorderEvent::Complete(status));
    }
}

struct Worker {
    request_id: String,
    endpoint: String,
    request: HttpRequestStart,
    store: Arc<dyn Store>,
    buckets: Arc<dyn Buckets>,
    request_size: i64,
    request_writer: Option<BlobWriter>,
    response_size: i64,
    response_writer: Option<BlobWriter>,
    response: Option<HttpResponseStart>,
    error: Option<String>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RecorderEvent>) {
        if let Err(err) = self
            .store
            .log_request(&self.request_id, &self.endpoint, &self.request)
            .await
        {
            warn!(request_id = %self.request_id, error = %err, "failed to record request");
        }

        while let Some(event) = rx.recv().await {
            match event {
                RecorderEvent::RequestData(msg) => self.write_request_data(msg).await,
                RecorderEvent::ResponseStart(msg) => self.response = Some(msg),
                RecorderEvent::ResponseData(msg) => self.write_response_data(msg).await,
                RecorderEvent::Error(msg) => self.error = msg.error,
                RecorderEvent::Complete(status) => {
                    self.finish(status).await;
                    return;
                }
            }
        }

        // The request went away without a terminal event; writers are
        // dropped, the row keeps its last state.
    }

    async fn write_request_data(&mut self, msg: HttpData) {
        if !msg.data.is_empty() && self.request_size >= 0 {
            if self.request_writer.is_none() {
                match self.buckets.open_request_writer(&self.request_id).await {
                    Ok(writer) => self.request_writer = Some(writer),
                    Err(err) => {
                        warn!(request_id = %self.request_id, error = %err, "failed to open request blob");
                        self.request_size = -1;
                    }
                }
            }

            if let Some(writer) = self.request_writer.as_mut() {
                match writer.write_all(&msg.data).await {
                    Ok(()) => self.request_size += msg.data.len() as i64,
                    Err(err) => {
                        warn!(request_id = %self.request_id, error = %err, "failed to write request blob");
                        self.request_size = -1;
                        self.request_writer = None;
                    }
                }
            }
        }

        if msg.completed {
            self.close_request_writer().await;
        }
    }

    async fn write_response_data(&mut self, msg: HttpData) {
        if !msg.data.is_empty() && self.response_size >= 0 {
            if self.response_writer.is_none() {
                match self.buckets.open_response_writer(&self.request_id).await {
                    Ok(writer) => self.response_writer = Some(writer),
                    Err(err) => {
                        warn!(request_id = %self.request_id, error = %err, "failed to open response blob");
                        self.response_size = -1;
                    }
                }
            }

            if let Some(writer) = self.response_writer.as_mut() {
                match writer.write_all(&msg.data).await {
                    Ok(()) => self.response_size += msg.data.len() as i64,
                    Err(err) => {
                        warn!(request_id = %self.request_id, error = %err, "failed to write response blob");
                        self.response_size = -1;
                        self.response_writer = None;
                    }
                }
            }
        }

        if msg.completed {
            self.close_response_writer().await;
        }
    }

    async fn finish(&mut self, status: Status) {
        self.close_request_writer().await;
        self.close_response_writer().await;

        let summary = ResponseSummary {
            request_size: self.request_size,
            response: self.response.take(),
            response_size: self.response_size,
            error: self.error.take(),
            status,
        };

        if let Err(err) = self.store.log_response(&self.request_id, summary).await {
            warn!(request_id = %self.request_id, error = %err, "failed to record outcome");
        }
    }

    async fn close_request_writer(&mut self) {
        if let Some(mut writer) = self.request_writer.take() {
            if let Err(err) = writer.shutdown().await {
                warn!(request_id = %self.request_id, error = %err, "failed to close request blob");
                self.request_size = -1;
            }
        }
    }

    async fn close_response_writer(&mut self) {
        if let Some(mut writer) = self.response_writer.take() {
            if let Err(err) = writer.shutdown().await {
                warn!(request_id = %self.request_id, error = %err, "failed to close response blob");
                self.response_size = -1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::request::{ORIGIN_AGENT, ORIGIN_INGRESS};
    use crate::publish::store::MemoryStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::HeaderMap;
    use parking_lot::Mutex;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::AsyncWrite;
    use webhook_tunnel_common::{Result, TunnelError};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl AsyncWrite for SharedBuf {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.0.lock().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[derive(Default)]
    struct MemoryBuckets {
        request: SharedBuf,
        response: SharedBuf,
        fail_request: bool,
    }

    #[async_trait]
    impl Buckets for MemoryBuckets {
        async fn open_request_writer(&self, _request_id: &str) -> Result<BlobWriter> {
            if self.fail_request {
                return Err(TunnelError::Internal("bucket unavailable".to_string()));
            }
            Ok(Box::new(self.request.clone()))
        }

        async fn open_response_writer(&self, _request_id: &str) -> Result<BlobWriter> {
            Ok(Box::new(self.response.clone()))
        }
    }

    fn new_request() -> TunneledRequest {
        TunneledRequest::new(
            "users".to_string(),
            "req_1".to_string(),
            HttpRequestStart {
                path: "/42".to_string(),
                method: "POST".to_string(),
                headers: HeaderMap::new(),
            },
        )
    }

    async fn wait_for_terminal(store: &MemoryStore, request_id: &str) -> crate::publish::StoreEntry {
        for _ in 0..100 {
            if let Some(entry) = store.entry(request_id).await {
                if entry.status.is_terminal() {
                    return entry;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("recorder never finished");
    }

    #[tokio::test]
    async fn test_records_bodies_and_summary() {
        let store = Arc::new(MemoryStore::new(1024 * 1024, 100));
        let buckets = Arc::new(MemoryBuckets::default());

        let request = new_request();
        Recorder::attach(&request, store.clone(), buckets.clone());

        request.emit_request_data(ORIGIN_INGRESS, Bytes::from_static(b"ping"), true);
        request.emit_response_start(ORIGIN_AGENT, HeaderMap::new(), 201);
        request.emit_response_data(ORIGIN_AGENT, Bytes::from_static(b"pong!"), true);

        let entry = wait_for_terminal(&store, "req_1").await;
        assert_eq!(entry.status, Status::Completed);
        assert_eq!(entry.request_size, 4);
        assert_eq!(entry.response_size, 5);
        assert_eq!(entry.response_status, 201);
        assert!(entry.completed.is_some());

        assert_eq!(&*buckets.request.0.lock(), b"ping");
        assert_eq!(&*buckets.response.0.lock(), b"pong!");
    }

    #[tokio::test]
    async fn test_bucket_failure_does_not_fail_the_request() {
        let store = Arc::new(MemoryStore::new(1024 * 1024, 100));
        let buckets = Arc::new(MemoryBuckets {
            fail_request: true,
            ..Default::default()
        });

        let request = new_request();
        Recorder::attach(&request, store.clone(), buckets);

        request.emit_request_data(ORIGIN_INGRESS, Bytes::from_static(b"body"), true);
        request.emit_response_start(ORIGIN_AGENT, HeaderMap::new(), 200);
        request.emit_response_data(ORIGIN_AGENT, Bytes::from_static(b"ok"), true);

        // The request still completes; the row carries the sentinel size
        let entry = wait_for_terminal(&store, "req_1").await;
        assert_eq!(entry.status, Status::Completed);
        assert_eq!(entry.request_size, -1);
        assert_eq!(entry.response_size, 2);
    }

    #[tokio::test]
    async fn test_cancelled_request_recorded_as_timeout() {
        let store = Arc::new(MemoryStore::new(1024 * 1024, 100));
        let buckets = Arc::new(MemoryBuckets::default());

        let request = new_request();
        Recorder::attach(&request, store.clone(), buckets);

        request.emit_request_data(ORIGIN_INGRESS, Bytes::from_static(b"partial"), false);
        request.cancel(ORIGIN_INGRESS);

        let entry = wait_for_terminal(&store, "req_1").await;
        assert_eq!(entry.status, Status::Timeout);
        assert_eq!(entry.request_size, 7);
        assert!(entry.error.is_none());
        assert!(entry.completed.is_some());
    }

    #[tokio::test]
    async fn test_empty_bodies_open_no_blobs() {
        let store = Arc::new(MemoryStore::new(1024 * 1024, 100));
        let buckets = Arc::new(MemoryBuckets::default());

        let request = new_request();
        Recorder::attach(&request, store.clone(), buckets.clone());

        request.emit_request_data(ORIGIN_INGRESS, Bytes::new(), true);
        request.emit_response_start(ORIGIN_AGENT, HeaderMap::new(), 204);
        request.emit_response_data(ORIGIN_AGENT, Bytes::new(), true);

        let entry = wait_for_terminal(&store, "req_1").await;
        assert_eq!(entry.request_size, 0);
        assert_eq!(entry.response_size, 0);
        assert!(buckets.request.0.lock().is_empty());
        assert!(buckets.response.0.lock().is_empty());
    }
}
