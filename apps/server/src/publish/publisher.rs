use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use webhook_tunnel_common::{Result, TunnelError, generate_request_id};

use super::buckets::Buckets;
use super::messages::HttpRequestStart;
use super::recorder::Recorder;
use super::request::TunneledRequest;
use super::store::{Store, StoreEntry};

/// Invoked with every request forwarded to the endpoint the handler is
/// registered for. The handler must register its listener before returning.
pub type RequestHandler = Arc<dyn Fn(Arc<TunneledRequest>) + Send + Sync>;

/// Endpoint registry and factory for tunneled requests. Each endpoint has
/// at most one handler; lookups are frequent relative to mutations, hence
/// the read/write lock.
pub struct Publisher {
    endpoints: RwLock<HashMap<String, RequestHandler>>,
    store: Arc<dyn Store>,
    buckets: Arc<dyn Buckets>,
}

impl Publisher {
    pub fn new(store: Arc<dyn Store>, buckets: Arc<dyn Buckets>) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            store,
            buckets,
        }
    }

    /// Register the handler for an endpoint. Fails when the endpoint is
    /// already taken.
    pub fn subscribe(&self, endpoint: &str, handler: RequestHandler) -> Result<()> {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(endpoint) {
            return Err(TunnelError::AlreadyRegistered);
        }

        endpoints.insert(endpoint.to_string(), handler);
        debug!(endpoint, "endpoint subscribed");
        Ok(())
    }

    /// Remove the endpoint. Idempotent. In-flight requests are not
    /// cancelled, they proceed to their natural terminal state.
    pub fn unsubscribe(&self, endpoint: &str) {
        self.endpoints.write().remove(endpoint);
        debug!(endpoint, "endpoint unsubscribed");
    }

    /// Create a tunneled request for an inbound call and hand it to the
    /// endpoint's handler. The caller keeps the returned reference for the
    /// duration of the HTTP exchange.
    pub fn forward_request(
        &self,
        endpoint: &str,
        request: HttpRequestStart,
    ) -> Result<Arc<TunneledRequest>> {
        let handler = self
            .endpoints
            .read()
            .get(endpoint)
            .cloned()
            .ok_or(TunnelError::NotRegistered)?;

        let request_id = generate_request_id();
        debug!(endpoint, %request_id, method = %request.method, path = %request.path, "forwarding request");

        let tunneled = Arc::new(TunneledRequest::new(
            endpoint.to_string(),
            request_id,
            request,
        ));

        // The recorder observes from the start; the handler registers its
        // own listener before it returns.
        Recorder::attach(&tunneled, self.store.clone(), self.buckets.clone());
        handler(tunneled.clone());

        Ok(tunneled)
    }

    /// Summary rows mutated after `etag`, for incremental listings
    pub async fn entries(&self, etag: i64) -> (Vec<StoreEntry>, i64) {
        self.store.entries(etag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::buckets::FsBuckets;
    use crate::publish::request::{ORIGIN_AGENT, ORIGIN_INGRESS, RequestListener};
    use crate::publish::status::Status;
    use crate::publish::store::MemoryStore;
    use crate::publish::{HttpData, HttpError};
    use bytes::Bytes;
    use http::HeaderMap;
    use parking_lot::Mutex;
    use std::sync::Barrier;

    fn new_publisher() -> Publisher {
        let store = Arc::new(MemoryStore::new(1024 * 1024, 100));
        let buckets = Arc::new(FsBuckets::new(std::env::temp_dir().join("wts-publisher-tests")));
        Publisher::new(store, buckets)
    }

    fn noop_handler() -> RequestHandler {
        Arc::new(|_| {})
    }

    fn start(path: &str) -> HttpRequestStart {
        HttpRequestStart {
            path: path.to_string(),
            method: "GET".to_string(),
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn test_second_subscribe_rejected() {
        let publisher = new_publisher();

        publisher.subscribe("users", noop_handler()).unwrap();
        let err = publisher.subscribe("users", noop_handler()).unwrap_err();
        assert!(matches!(err, TunnelError::AlreadyRegistered));

        // A different endpoint is still free
        publisher.subscribe("orders", noop_handler()).unwrap();
    }

    #[test]
    fn test_concurrent_subscribe_exactly_one_wins() {
        let publisher = Arc::new(new_publisher());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let publisher = publisher.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    publisher.subscribe("users", Arc::new(|_| {})).is_ok()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let publisher = new_publisher();
        publisher.subscribe("users", noop_handler()).unwrap();

        publisher.unsubscribe("users");
        publisher.unsubscribe("users");
        publisher.unsubscribe("ghost");

        // The name can be taken again
        publisher.subscribe("users", noop_handler()).unwrap();
    }

    #[tokio::test]
    async fn test_forward_without_subscriber() {
        let publisher = new_publisher();

        let err = publisher.forward_request("ghost", start("/x")).unwrap_err();
        assert!(matches!(err, TunnelError::NotRegistered));
    }

    #[tokio::test]
    async fn test_handler_invoked_synchronously() {
        let publisher = new_publisher();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_by_handler = seen.clone();
        publisher
            .subscribe(
                "users",
                Arc::new(move |request| {
                    seen_by_handler.lock().push(request.request_id.clone());
                }),
            )
            .unwrap();

        let tunneled = publisher.forward_request("users", start("/1")).unwrap();
        assert_eq!(&*seen.lock(), &[tunneled.request_id.clone()]);
    }

    struct Tracking {
        completed: Arc<Mutex<Option<Status>>>,
    }

    impl RequestListener for Tracking {
        fn on_request_data(&mut self, _msg: &HttpData) {}
        fn on_error(&mut self, _msg: &HttpError) {}
        fn on_complete(&mut self, status: Status) {
            *self.completed.lock() = Some(status);
        }
    }

    #[tokio::test]
    async fn test_in_flight_request_survives_unsubscribe() {
        let publisher = new_publisher();
        let completed: Arc<Mutex<Option<Status>>> = Arc::new(Mutex::new(None));

        let completed_by_agent = completed.clone();
        publisher
            .subscribe(
                "users",
                Arc::new(move |request| {
                    request.listen(
                        ORIGIN_AGENT,
                        Box::new(Tracking {
                            completed: completed_by_agent.clone(),
                        }),
                    );
                }),
            )
            .unwrap();

        let tunneled = publisher.forward_request("users", start("/1")).unwrap();
        publisher.unsubscribe("users");

        // New requests are rejected...
        assert!(matches!(
            publisher.forward_request("users", start("/2")),
            Err(TunnelError::NotRegistered)
        ));

        // ...but the in-flight one still completes normally
        tunneled.emit_request_data(ORIGIN_INGRESS, Bytes::new(), true);
        tunneled.emit_response_start(ORIGIN_AGENT, HeaderMap::new(), 200);
        tunneled.emit_response_data(ORIGIN_AGENT, Bytes::from_static(b"hi"), true);

        assert_eq!(*completed.lock(), Some(Status::Completed));
    }
}
