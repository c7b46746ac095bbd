//! The agent stream server: one WebSocket session per agent, multiplexing
//! all requests for the subscribed endpoint over the single connection.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::SinkExt;
use futures_util::stream::{SplitSink, StreamExt};
use http::HeaderMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webhook_tunnel_common::{
    ClientMessage, Result, ServerMessage, TunnelError, decode_body, encode_body, headers_to_map,
    map_to_headers,
};

use crate::AppState;
use crate::auth::agent_token_valid;
use crate::publish::{
    HttpData, HttpError, ORIGIN_AGENT, Publisher, RequestListener, Status, TunneledRequest,
};

/// WebSocket upgrade for the agent tunnel.
///
/// GET /tunnel
pub async fn tunnel_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !agent_token_valid(&headers, state.config.agent_key.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let publisher = state.publisher.clone();
    ws.on_upgrade(move |socket| handle_session(socket, publisher))
}

/// Everything the request side hands to the session task. A single FIFO
/// channel keeps RequestStart ahead of that request's data on the wire.
enum SessionEvent {
    RequestStart(Arc<TunneledRequest>),
    RequestData {
        request_id: String,
        data: Bytes,
        completed: bool,
    },
    RequestError {
        request_id: String,
        error: Option<String>,
        timeout: bool,
    },
    RequestDone {
        request_id: String,
    },
}

/// Listener attached to every forwarded request. It only hands off to the
/// session channel; once the session is gone the sends become no-ops.
struct ForwardingListener {
    request_id: String,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl RequestListener for ForwardingListener {
    fn on_request_data(&mut self, msg: &HttpData) {
        let _ = self.events.send(SessionEvent::RequestData {
            request_id: self.request_id.clone(),
            data: msg.data.clone(),
            completed: msg.completed,
        });
    }

    fn on_error(&mut self, msg: &HttpError) {
        let _ = self.events.send(SessionEvent::RequestError {
            request_id: self.request_id.clone(),
            error: msg.error.clone(),
            timeout: msg.timeout,
        });
    }

    fn on_complete(&mut self, _status: Status) {
        let _ = self.events.send(SessionEvent::RequestDone {
            request_id: self.request_id.clone(),
        });
    }
}

struct Session {
    publisher: Arc<Publisher>,
    endpoint: String,
    requests: HashMap<String, Arc<TunneledRequest>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

async fn handle_session(socket: WebSocket, publisher: Arc<Publisher>) {
    info!("tunnel opened by agent");

    let (mut sink, mut stream) = socket.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let mut session = Session {
        publisher,
        endpoint: String::new(),
        requests: HashMap::new(),
        events: events_tx,
    };

    let result: Result<()> = loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                None => break Ok(()),
                Some(Err(err)) => break Err(TunnelError::WebSocket(err.to_string())),
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => {
                            if let Err(err) = session.handle_message(message) {
                                break Err(err);
                            }
                        }
                        Err(err) => warn!(error = %err, "dropping malformed agent message"),
                    }
                }
                Some(Ok(Message::Close(_))) => break Ok(()),
                Some(Ok(_)) => {}
            },
            Some(event) = events_rx.recv() => {
                session.handle_event(&mut sink, event).await;
            }
        }
    };

    match &result {
        Ok(()) => info!(endpoint = %session.endpoint, "tunnel closed by agent"),
        Err(err) => {
            warn!(endpoint = %session.endpoint, error = %err, "tunnel session failed");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: err.to_string().into(),
                })))
                .await;
        }
    }

    session.shutdown();
}

impl Session {
    /// Dispatch one message received from the agent
    fn handle_message(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Subscribe { endpoint } => self.subscribe(endpoint),

            _ if self.endpoint.is_empty() => {
                Err(TunnelError::Transport("not subscribed yet".to_string()))
            }

            ClientMessage::ResponseStart {
                request_id,
                headers,
                status,
            } => {
                let Some(request) = self.requests.get(&request_id) else {
                    self.log_unknown(&request_id);
                    return Ok(());
                };
                request.emit_response_start(ORIGIN_AGENT, map_to_headers(&headers), status);
                Ok(())
            }

            ClientMessage::ResponseData {
                request_id,
                data,
                completed,
            } => {
                let Some(request) = self.requests.get(&request_id) else {
                    self.log_unknown(&request_id);
                    return Ok(());
                };
                match decode_body(&data) {
                    Ok(bytes) => {
                        request.emit_response_data(ORIGIN_AGENT, bytes.into(), completed);
                    }
                    Err(err) => {
                        request.emit_error(
                            ORIGIN_AGENT,
                            Some(format!("invalid response chunk: {err}")),
                            false,
                        );
                    }
                }
                Ok(())
            }

            ClientMessage::TransportError {
                request_id,
                error,
                timeout,
            } => {
                let Some(request) = self.requests.get(&request_id) else {
                    self.log_unknown(&request_id);
                    return Ok(());
                };
                request.emit_error(ORIGIN_AGENT, error, timeout);
                Ok(())
            }
        }
    }

    /// Claim the endpoint for this session. Valid exactly once.
    fn subscribe(&mut self, endpoint: String) -> Result<()> {
        if !self.endpoint.is_empty() {
            return Err(TunnelError::Transport(format!(
                "already subscribed to {}",
                self.endpoint
            )));
        }

        let events = self.events.clone();
        self.publisher.subscribe(
            &endpoint,
            Arc::new(move |request: Arc<TunneledRequest>| {
                // Enqueue the start before attaching the listener, so the
                // wire sees RequestStart ahead of the first RequestData.
                let _ = events.send(SessionEvent::RequestStart(request.clone()));
                request.listen(
                    ORIGIN_AGENT,
                    Box::new(ForwardingListener {
                        request_id: request.request_id.clone(),
                        events: events.clone(),
                    }),
                );
            }),
        )?;

        info!(%endpoint, "agent subscribed");
        self.endpoint = endpoint;
        Ok(())
    }

    /// Serialize one request-side event onto the stream. Send failures
    /// terminate the affected request but not the session; a broken socket
    /// surfaces in the read loop.
    async fn handle_event(&mut self, sink: &mut SplitSink<WebSocket, Message>, event: SessionEvent) {
        match event {
            SessionEvent::RequestStart(request) => {
                let message = ServerMessage::RequestStart {
                    request_id: request.request_id.clone(),
                    endpoint: request.endpoint.clone(),
                    path: request.request.path.clone(),
                    method: request.request.method.clone(),
                    headers: headers_to_map(&request.request.headers),
                };

                match send_message(sink, &message).await {
                    Ok(()) => {
                        info!(
                            endpoint = %request.endpoint,
                            method = %request.request.method,
                            path = %request.request.path,
                            "forwarding request to agent"
                        );
                        self.requests.insert(request.request_id.clone(), request);
                    }
                    Err(err) => {
                        // The agent never saw this request
                        request.emit_error(ORIGIN_AGENT, Some(err.to_string()), false);
                    }
                }
            }

            SessionEvent::RequestData {
                request_id,
                data,
                completed,
            } => {
                if !self.requests.contains_key(&request_id) {
                    return;
                }

                let message = ServerMessage::RequestData {
                    request_id: request_id.clone(),
                    data: encode_body(&data),
                    completed,
                };
                if send_message(sink, &message).await.is_err() {
                    self.requests.remove(&request_id);
                }
            }

            SessionEvent::RequestError {
                request_id,
                error,
                timeout,
            } => {
                // The request is finished either way; tell the agent so it
                // can abort the local replay.
                if self.requests.remove(&request_id).is_some() {
                    let message = ServerMessage::TransportError {
                        request_id,
                        error,
                        timeout,
                    };
                    let _ = send_message(sink, &message).await;
                }
            }

            SessionEvent::RequestDone { request_id } => {
                self.requests.remove(&request_id);
            }
        }
    }

    /// Cancel everything still in flight and free the endpoint
    fn shutdown(&mut self) {
        for (_, request) in self.requests.drain() {
            request.cancel(ORIGIN_AGENT);
        }

        if !self.endpoint.is_empty() {
            self.publisher.unsubscribe(&self.endpoint);
        }
    }

    fn log_unknown(&self, request_id: &str) {
        debug!(request_id, "agent referenced an unknown request");
    }
}

async fn send_message(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<()> {
    let json = serde_json::to_string(message)?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|err| TunnelError::WebSocket(err.to_string()))
}
