use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;

use super::messages::{HttpData, HttpError, HttpRequestStart, HttpResponseStart};
use super::status::Status;

/// Tag identifying the emitter of an event. A listener never receives
/// events that were emitted with its own origin, which lets the two tunnel
/// sides share one request without echoing their own data back.
pub type Origin = u32;

/// The ingress side of the tunnel (public HTTP request)
pub const ORIGIN_INGRESS: Origin = 1;

/// The agent side of the tunnel (bidirectional stream session)
pub const ORIGIN_AGENT: Origin = 2;

/// The recorder, which only observes and therefore sees everything
pub const ORIGIN_RECORDER: Origin = 3;

/// Callbacks invoked for events on a tunneled request.
///
/// Callbacks run under the request lock and must not block or re-enter the
/// emit methods; hand off to a channel before doing I/O.
pub trait RequestListener: Send {
    fn on_request_data(&mut self, _msg: &HttpData) {}

    fn on_response_start(&mut self, _msg: &HttpResponseStart) {}

    fn on_response_data(&mut self, _msg: &HttpData) {}

    fn on_error(&mut self, _msg: &HttpError) {}

    /// Delivered to every listener exactly once, after its final typed
    /// event, when the request reaches a terminal state.
    fn on_complete(&mut self, _status: Status) {}
}

struct Shared {
    status: Status,
    listeners: Vec<(Origin, Box<dyn RequestListener>)>,
}

/// The per-request state machine and event bus.
///
/// One instance lives for the duration of a single HTTP request/response
/// pair. The ingress side emits request data, the agent side emits the
/// response; invalid emissions for the current state are silently dropped.
pub struct TunneledRequest {
    pub endpoint: String,
    pub request_id: String,
    pub request: HttpRequestStart,
    shared: Mutex<Shared>,
}

impl std::fmt::Debug for TunneledRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunneledRequest")
            .field("endpoint", &self.endpoint)
            .field("request_id", &self.request_id)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl TunneledRequest {
    pub fn new(endpoint: String, request_id: String, request: HttpRequestStart) -> Self {
        Self {
            endpoint,
            request_id,
            request,
            shared: Mutex::new(Shared {
                status: Status::RequestStarted,
                listeners: Vec::new(),
            }),
        }
    }

    /// Current lifecycle state
    pub fn status(&self) -> Status {
        self.shared.lock().status
    }

    /// Register a listener. Events emitted after registration are
    /// delivered; nothing is delivered once the request is terminal.
    pub fn listen(&self, origin: Origin, listener: Box<dyn RequestListener>) {
        let mut shared = self.shared.lock();
        if shared.status.is_terminal() {
            return;
        }

        shared.listeners.push((origin, listener));
    }

    /// Emit one request body chunk. Valid only while the upload is open.
    pub fn emit_request_data(&self, origin: Origin, data: Bytes, completed: bool) {
        let mut shared = self.shared.lock();
        if shared.status != Status::RequestStarted {
            return;
        }

        // Transition first, in case a listener panics.
        if completed {
            shared.status = Status::RequestCompleted;
        }

        let msg = HttpData { data, completed };
        for (o, listener) in shared.listeners.iter_mut() {
            if *o != origin {
                listener.on_request_data(&msg);
            }
        }
    }

    /// Emit the response status line and headers. Valid once the upload
    /// has completed.
    pub fn emit_response_start(&self, origin: Origin, headers: HeaderMap, status: u16) {
        let mut shared = self.shared.lock();
        if shared.status != Status::RequestCompleted {
            return;
        }

        shared.status = Status::ResponseStarted;

        let msg = HttpResponseStart { headers, status };
        for (o, listener) in shared.listeners.iter_mut() {
            if *o != origin {
                listener.on_response_start(&msg);
            }
        }
    }

    /// Emit one response body chunk. `completed` finishes the request.
    pub fn emit_response_data(&self, origin: Origin, data: Bytes, completed: bool) {
        let mut shared = self.shared.lock();
        if shared.status != Status::ResponseStarted {
            return;
        }

        if completed {
            shared.status = Status::Completed;
        }

        let msg = HttpData { data, completed };
        for (o, listener) in shared.listeners.iter_mut() {
            if *o != origin {
                listener.on_response_data(&msg);
            }
        }

        if completed {
            Self::complete(&mut shared);
        }
    }

    /// Fail the request from any non-terminal state. At most one terminal
    /// transition ever happens; later calls are no-ops.
    pub fn emit_error(&self, origin: Origin, error: Option<String>, timeout: bool) {
        let mut shared = self.shared.lock();
        if shared.status.is_terminal() {
            return;
        }

        shared.status = if timeout { Status::Timeout } else { Status::Failed };

        let msg = HttpError { error, timeout };
        for (o, listener) in shared.listeners.iter_mut() {
            if *o != origin {
                listener.on_error(&msg);
            }
        }

        Self::complete(&mut shared);
    }

    /// Cancel the request, recording it as a timeout
    pub fn cancel(&self, origin: Origin) {
        self.emit_error(origin, None, true);
    }

    // The synthetic completion is not origin filtered: the side that caused
    // the terminal transition still needs it for its own teardown.
    fn complete(shared: &mut Shared) {
        let status = shared.status;
        for (_, listener) in shared.listeners.iter_mut() {
            listener.on_complete(status);
        }
    }
}
