//! One connection to the tunnel server: subscribe, then demultiplex
//! forwarded requests into concurrent local replays.

use std::collections::HashMap;
use std::io;

use bytes::Bytes;
use futures_channel::mpsc as futures_mpsc;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use webhook_tunnel_common::constants::SESSION_CHANNEL_CAPACITY;
use webhook_tunnel_common::{ClientMessage, Result, ServerMessage, TunnelError, decode_body};

use crate::Config;
use crate::replay::{self, ForwardedRequest};

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How a session ended. `Fatal` means reconnecting would not help.
#[derive(Debug)]
pub enum SessionEnd {
    Closed,
    Fatal(String),
}

/// Body chunks flowing into one in-flight replay; an Err aborts it
type BodySender = futures_mpsc::UnboundedSender<io::Result<Bytes>>;

/// Run one session until the connection drops
pub async fn run(config: &Config) -> Result<SessionEnd> {
    let mut ws = establish_connection(config).await?;

    // Claim the endpoint before anything else
    let subscribe = ClientMessage::Subscribe {
        endpoint: config.endpoint.clone(),
    };
    send_message(&mut ws, &subscribe).await?;

    info!(endpoint = %config.endpoint, "tunnel established");

    let (write, mut read) = ws.split();
    let (outgoing_tx, outgoing_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);

    let write_task = tokio::spawn(write_loop(write, outgoing_rx));
    let heartbeat_task = tokio::spawn(heartbeat_loop(
        outgoing_tx.clone(),
        config.heartbeat_interval,
    ));

    let client = reqwest::Client::new();
    let mut requests: HashMap<String, BodySender> = HashMap::new();
    let mut end = SessionEnd::Closed;

    while let Some(frame) = read.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(message) => {
                    handle_message(config, &client, &outgoing_tx, &mut requests, message);
                }
                Err(err) => warn!(error = %err, "dropping malformed server message"),
            },
            Ok(WsMessage::Close(frame)) => {
                if let Some(frame) = frame {
                    let reason = frame.reason.as_str().to_string();
                    info!(%reason, "server closed the session");
                    if reason.contains("subscribed") || reason.contains("subscriber") {
                        end = SessionEnd::Fatal(reason);
                    }
                } else {
                    info!("server closed the session");
                }
                break;
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(_) => warn!("received unexpected binary message"),
            Err(err) => {
                error!(error = %err, "tunnel stream interrupted");
                break;
            }
        }
    }

    // Abort everything still in flight; replies have nowhere to go anymore.
    for (_, body) in requests.drain() {
        let _ = body.unbounded_send(Err(io::Error::other("tunnel closed")));
    }

    write_task.abort();
    heartbeat_task.abort();

    Ok(end)
}

/// Dial the server, presenting the bearer token when one is configured
async fn establish_connection(config: &Config) -> Result<WebSocket> {
    debug!("connecting to {}", config.server_url);

    let mut request = config
        .server_url
        .clone()
        .into_client_request()
        .map_err(|e| TunnelError::Transport(format!("invalid server URL: {e}")))?;

    if let Some(token) = &config.token {
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TunnelError::Transport(format!("invalid token: {e}")))?,
        );
    }

    let connect = connect_async(request);
    let (ws, _) = tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| TunnelError::Timeout)?
        .map_err(|e| TunnelError::WebSocket(e.to_string()))?;

    Ok(ws)
}

/// Dispatch one message from the server
fn handle_message(
    config: &Config,
    client: &reqwest::Client,
    outgoing: &mpsc::Sender<WsMessage>,
    requests: &mut HashMap<String, BodySender>,
    message: ServerMessage,
) {
    match message {
        ServerMessage::RequestStart {
            request_id,
            path,
            method,
            headers,
            ..
        } => {
            debug!(%method, %path, "received forwarded request");

            let (body_tx, body_rx) = futures_mpsc::unbounded();
            requests.insert(request_id.clone(), body_tx);

            let forwarded = ForwardedRequest {
                request_id,
                path,
                method,
                headers,
            };

            // Each request replays concurrently against the local service
            tokio::spawn(replay::replay(
                client.clone(),
                config.local_address.clone(),
                forwarded,
                body_rx,
                outgoing.clone(),
            ));
        }

        ServerMessage::RequestData {
            request_id,
            data,
            completed,
        } => {
            let Some(body) = requests.get(&request_id) else {
                debug!(%request_id, "data for unknown request");
                return;
            };

            match decode_body(&data) {
                Ok(bytes) => {
                    if !bytes.is_empty() {
                        let _ = body.unbounded_send(Ok(bytes.into()));
                    }
                }
                Err(err) => {
                    let _ = body.unbounded_send(Err(io::Error::other(format!(
                        "invalid request chunk: {err}"
                    ))));
                    requests.remove(&request_id);
                    return;
                }
            }

            if completed {
                // Dropping the sender ends the replay's body stream
                requests.remove(&request_id);
            }
        }

        ServerMessage::TransportError {
            request_id,
            error,
            timeout,
        } => {
            let reason = error.unwrap_or_else(|| {
                if timeout {
                    "request cancelled".to_string()
                } else {
                    "transport error".to_string()
                }
            });
            debug!(%request_id, %reason, "server aborted request");

            if let Some(body) = requests.remove(&request_id) {
                let _ = body.unbounded_send(Err(io::Error::other(reason)));
            }
        }
    }
}

/// The write half: the only task that touches the outgoing stream
async fn write_loop(
    mut write: SplitSink<WebSocket, WsMessage>,
    mut outgoing_rx: mpsc::Receiver<WsMessage>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        if let Err(err) = write.send(message).await {
            error!(error = %err, "failed to send message");
            break;
        }
    }

    debug!("write task exiting");
}

/// Periodic WebSocket pings keep idle connections alive
async fn heartbeat_loop(outgoing_tx: mpsc::Sender<WsMessage>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick fires immediately

    loop {
        ticker.tick().await;
        if outgoing_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
            break;
        }
        debug!("sent heartbeat");
    }
}

async fn send_message(ws: &mut WebSocket, message: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    ws.send(WsMessage::Text(json.into()))
        .await
        .map_err(|e| TunnelError::WebSocket(e.to_string()))
}
