//! Replays one forwarded request against the local HTTP service and
//! streams the response back through the tunnel.

use std::collections::HashMap;
use std::io;

use bytes::Bytes;
use futures_util::StreamExt;
use futures_channel::mpsc as futures_mpsc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info};
use webhook_tunnel_common::constants::BODY_CHUNK_SIZE;
use webhook_tunnel_common::{ClientMessage, Result, TunnelError, encode_body, headers_to_map};

/// The request as announced by the server
pub struct ForwardedRequest {
    pub request_id: String,
    pub path: String,
    pub method: String,
    pub headers: HashMap<String, Vec<String>>,
}

/// Replay the request and report the outcome through the tunnel. Failures
/// become a TransportError for this request; the session stays up.
pub async fn replay(
    client: reqwest::Client,
    local_base: String,
    request: ForwardedRequest,
    body: futures_mpsc::UnboundedReceiver<io::Result<Bytes>>,
    outgoing: mpsc::Sender<WsMessage>,
) {
    let request_id = request.request_id.clone();
    let method = request.method.clone();
    let path = request.path.clone();

    match run(client, local_base, request, body, &outgoing).await {
        Ok(status) => info!("{:7} {} -> {}", method, path, status),
        Err(err) => {
            error!("{:7} {} failed: {}", method, path, err);

            let message = ClientMessage::TransportError {
                request_id,
                error: Some(err.to_string()),
                timeout: false,
            };
            let _ = send_message(&outgoing, &message).await;
        }
    }
}

async fn run(
    client: reqwest::Client,
    local_base: String,
    request: ForwardedRequest,
    body: futures_mpsc::UnboundedReceiver<io::Result<Bytes>>,
    outgoing: &mpsc::Sender<WsMessage>,
) -> Result<u16> {
    let url = combine_url(&local_base, &request.path);

    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| TunnelError::Http(format!("unsupported method: {}", request.method)))?;

    let mut builder = client.request(method, &url);
    for (name, values) in request.headers.iter() {
        for value in values {
            builder = builder.header(name, value);
        }
    }

    let response = builder
        .body(reqwest::Body::wrap_stream(body))
        .send()
        .await
        .map_err(|e| TunnelError::Http(e.to_string()))?;

    let status = response.status().as_u16();
    let start = ClientMessage::ResponseStart {
        request_id: request.request_id.clone(),
        headers: headers_to_map(response.headers()),
        status,
    };
    send_message(outgoing, &start).await?;

    // From here on the response is streamed; errors can no longer rewrite
    // the status, the server tears the caller's connection down instead.
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TunnelError::Http(e.to_string()))?;

        for piece in chunk.chunks(BODY_CHUNK_SIZE) {
            let message = ClientMessage::ResponseData {
                request_id: request.request_id.clone(),
                data: encode_body(piece),
                completed: false,
            };
            send_message(outgoing, &message).await?;
        }
    }

    let done = ClientMessage::ResponseData {
        request_id: request.request_id,
        data: String::new(),
        completed: true,
    };
    send_message(outgoing, &done).await?;

    Ok(status)
}

async fn send_message(outgoing: &mpsc::Sender<WsMessage>, message: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(message)?;
    outgoing
        .send(WsMessage::Text(json.into()))
        .await
        .map_err(|e| TunnelError::WebSocket(e.to_string()))
}

fn combine_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        return base.to_string();
    }

    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}
