//! The public ingress: bridges one inbound HTTP request onto a tunneled
//! request and streams the agent's response back to the caller.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::mpsc;
use tracing::{info, warn};
use webhook_tunnel_common::TunnelError;

use crate::AppState;
use crate::publish::{
    HttpData, HttpError, HttpRequestStart, HttpResponseStart, ORIGIN_INGRESS, RequestListener,
    Status, TunneledRequest,
};

enum IngressEvent {
    ResponseStart(HttpResponseStart),
    ResponseData { data: Bytes, completed: bool },
    Error(HttpError),
    Done,
}

/// Listener attached with the ingress origin; hands events to the waiting
/// HTTP handler and never blocks.
struct IngressListener {
    events: mpsc::UnboundedSender<IngressEvent>,
}

impl RequestListener for IngressListener {
    fn on_response_start(&mut self, msg: &HttpResponseStart) {
        let _ = self.events.send(IngressEvent::ResponseStart(msg.clone()));
    }

    fn on_response_data(&mut self, msg: &HttpData) {
        let _ = self.events.send(IngressEvent::ResponseData {
            data: msg.data.clone(),
            completed: msg.completed,
        });
    }

    fn on_error(&mut self, msg: &HttpError) {
        let _ = self.events.send(IngressEvent::Error(msg.clone()));
    }

    fn on_complete(&mut self, _status: Status) {
        let _ = self.events.send(IngressEvent::Done);
    }
}

/// Cancels the request when the HTTP side goes away, whatever the reason.
/// Cancellation after a terminal transition is a no-op.
struct CancelGuard {
    request: Arc<TunneledRequest>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.request.cancel(ORIGIN_INGRESS);
    }
}

/// Catch-all handler for `/endpoints/{name}/{rest...}`.
pub async fn ingress_handler(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let Some((endpoint, mut path)) = split_endpoint_and_path(parts.uri.path()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // Fragments never reach the server, only the query string matters.
    if let Some(query) = parts.uri.query() {
        path.push('?');
        path.push_str(query);
    }

    info!(%endpoint, %path, "received webhook call");

    let forwarded = HttpRequestStart {
        path,
        method: parts.method.to_string(),
        headers: parts.headers,
    };

    let tunneled = match state.publisher.forward_request(&endpoint, forwarded) {
        Ok(tunneled) => tunneled,
        Err(TunnelError::NotRegistered) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(err) => {
            warn!(%endpoint, error = %err, "failed to forward request");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tunneled.listen(ORIGIN_INGRESS, Box::new(IngressListener { events: events_tx }));

    let guard = CancelGuard {
        request: tunneled.clone(),
    };

    // Pump the request body upstream in bounded chunks; the final empty
    // chunk closes the upload.
    let mut body_stream = body.into_data_stream();
    loop {
        match body_stream.next().await {
            Some(Ok(chunk)) => tunneled.emit_request_data(ORIGIN_INGRESS, chunk, false),
            Some(Err(err)) => {
                tunneled.emit_error(ORIGIN_INGRESS, Some(err.to_string()), false);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            None => {
                tunneled.emit_request_data(ORIGIN_INGRESS, Bytes::new(), true);
                break;
            }
        }
    }

    // Wait for the agent's response, the deadline, or a failure.
    let timeout = state.config.request_timeout;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let response_start = loop {
        tokio::select! {
            _ = &mut deadline => {
                tunneled.cancel(ORIGIN_INGRESS);
                return StatusCode::GATEWAY_TIMEOUT.into_response();
            }
            event = events_rx.recv() => match event {
                Some(IngressEvent::ResponseStart(start)) => break start,
                Some(IngressEvent::Error(err)) => return error_response(err),
                Some(IngressEvent::Done) => return StatusCode::OK.into_response(),
                Some(IngressEvent::ResponseData { .. }) => {}
                None => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
    };

    stream_response(response_start, events_rx, guard, timeout)
}

/// Build the streaming response once the status line has arrived. From
/// here on the status cannot be rewritten; a later failure tears the
/// connection down mid-body instead.
fn stream_response(
    start: HttpResponseStart,
    events_rx: mpsc::UnboundedReceiver<IngressEvent>,
    guard: CancelGuard,
    idle_timeout: Duration,
) -> Response {
    struct BodyState {
        events: mpsc::UnboundedReceiver<IngressEvent>,
        guard: CancelGuard,
        idle_timeout: Duration,
    }

    let state = BodyState {
        events: events_rx,
        guard,
        idle_timeout,
    };

    let body_stream = stream::unfold(state, |mut state| async move {
        loop {
            let event = match tokio::time::timeout(state.idle_timeout, state.events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    state.guard.request.cancel(ORIGIN_INGRESS);
                    return Some((Err(std::io::Error::other("response timed out")), state));
                }
            };

            match event {
                Some(IngressEvent::ResponseData { data, .. }) => {
                    // The final chunk is followed by Done, which ends the
                    // stream; empty chunks carry nothing worth writing.
                    if data.is_empty() {
                        continue;
                    }
                    return Some((Ok(data), state));
                }
                Some(IngressEvent::Error(err)) => {
                    let text = err.error.unwrap_or_else(|| "request aborted".to_string());
                    return Some((Err(std::io::Error::other(text)), state));
                }
                Some(IngressEvent::Done) | None => return None,
                Some(_) => continue,
            }
        }
    });

    let mut builder = Response::builder().status(start.status);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(start.headers);
    }

    builder
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn error_response(err: HttpError) -> Response {
    if err.timeout {
        return StatusCode::GATEWAY_TIMEOUT.into_response();
    }

    let text = err.error.unwrap_or_default();
    (StatusCode::INTERNAL_SERVER_ERROR, text).into_response()
}

/// Split `/endpoints/{name}/{rest...}` into the endpoint name and the
/// downstream path. The trailing slash of the original path is preserved.
fn split_endpoint_and_path(raw_path: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = raw_path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() < 2 {
        return None;
    }

    let mut path = parts[2..].join("/");
    if !path.is_empty() {
        path.insert(0, '/');
    }

    if raw_path.ends_with('/') {
        path.push('/');
    }

    Some((parts[1].to_string(), path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple() {
        let (endpoint, path) = split_endpoint_and_path("/endpoints/users/42").unwrap();
        assert_eq!(endpoint, "users");
        assert_eq!(path, "/42");
    }

    #[test]
    fn test_split_deep_path() {
        let (endpoint, path) = split_endpoint_and_path("/endpoints/hooks/github/push").unwrap();
        assert_eq!(endpoint, "hooks");
        assert_eq!(path, "/github/push");
    }

    #[test]
    fn test_split_endpoint_only() {
        let (endpoint, path) = split_endpoint_and_path("/endpoints/users").unwrap();
        assert_eq!(endpoint, "users");
        assert_eq!(path, "");
    }

    #[test]
    fn test_split_preserves_trailing_slash() {
        let (_, path) = split_endpoint_and_path("/endpoints/users/42/").unwrap();
        assert_eq!(path, "/42/");

        let (_, path) = split_endpoint_and_path("/endpoints/users/").unwrap();
        assert_eq!(path, "/");
    }

    #[test]
    fn test_split_too_short() {
        assert!(split_endpoint_and_path("/endpoints").is_none());
        assert!(split_endpoint_and_path("/endpoints/").is_none());
        assert!(split_endpoint_and_path("/").is_none());
        assert!(split_endpoint_and_path("").is_none());
    }

    #[test]
    fn test_split_collapses_double_slashes() {
        let (endpoint, path) = split_endpoint_and_path("/endpoints//users//42").unwrap();
        assert_eq!(endpoint, "users");
        assert_eq!(path, "/42");
    }
}
