use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Header maps are serialized as name -> list of values. Lookup is
/// case-insensitive on both ends; the wire carries the normalized name.
pub type HeaderMap = HashMap<String, Vec<String>>;

/// Messages sent by the agent to the tunnel server.
///
/// The first and only accepted message on a fresh session is `Subscribe`;
/// everything else refers to a request previously forwarded by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Claim an endpoint for this session. Valid exactly once.
    Subscribe { endpoint: String },

    /// Status line and headers of the replayed response.
    ResponseStart {
        request_id: String,
        headers: HeaderMap,
        status: u16,
    },

    /// One response body chunk, Base64 encoded. `completed` marks the end
    /// of the response and thereby of the whole request.
    ResponseData {
        request_id: String,
        #[serde(default)]
        data: String,
        completed: bool,
    },

    /// The agent could not produce a response for the request.
    TransportError {
        request_id: String,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        timeout: bool,
    },
}

/// Messages sent by the tunnel server to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A new inbound request for the subscribed endpoint.
    RequestStart {
        request_id: String,
        endpoint: String,
        path: String,
        method: String,
        headers: HeaderMap,
    },

    /// One request body chunk, Base64 encoded. `completed` marks the end
    /// of the upload; a request without a body carries a single empty
    /// completed chunk.
    RequestData {
        request_id: String,
        #[serde(default)]
        data: String,
        completed: bool,
    },

    /// The server gave up on the request. `timeout` without error text is
    /// a cancellation.
    TransportError {
        request_id: String,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        timeout: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_serialization() {
        let msg = ClientMessage::Subscribe {
            endpoint: "users".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"subscribe","endpoint":"users"}"#);

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ClientMessage::Subscribe { endpoint } if endpoint == "users"));
    }

    #[test]
    fn test_response_start_serialization() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type".to_string(), vec!["text/plain".to_string()]);

        let msg = ClientMessage::ResponseStart {
            request_id: "req_123".to_string(),
            headers,
            status: 200,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"response_start"#));
        assert!(json.contains(r#""status":200"#));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::ResponseStart {
                request_id, status, ..
            } => {
                assert_eq!(request_id, "req_123");
                assert_eq!(status, 200);
            }
            _ => panic!("Expected ResponseStart"),
        }
    }

    #[test]
    fn test_response_data_defaults() {
        // An omitted data field parses as the empty chunk
        let json = r#"{"type":"response_data","request_id":"req_1","completed":true}"#;

        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::ResponseData {
                data, completed, ..
            } => {
                assert_eq!(data, "");
                assert!(completed);
            }
            _ => panic!("Expected ResponseData"),
        }
    }

    #[test]
    fn test_transport_error_cancellation() {
        // timeout=true with no error text is the cancellation form
        let msg = ServerMessage::TransportError {
            request_id: "req_9".to_string(),
            error: None,
            timeout: true,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"transport_error"#));
        assert!(json.contains(r#""timeout":true"#));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerMessage::TransportError { error, timeout, .. } => {
                assert!(error.is_none());
                assert!(timeout);
            }
            _ => panic!("Expected TransportError"),
        }
    }

    #[test]
    fn test_request_start_serialization() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie".to_string(),
            vec!["session=abc".to_string(), "token=xyz".to_string()],
        );

        let msg = ServerMessage::RequestStart {
            request_id: "req_42".to_string(),
            endpoint: "users".to_string(),
            path: "/42?x=1".to_string(),
            method: "GET".to_string(),
            headers,
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"request_start"#));
        assert!(json.contains(r#""path":"/42?x=1"#));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerMessage::RequestStart {
                endpoint, headers, ..
            } => {
                assert_eq!(endpoint, "users");
                assert_eq!(headers.get("cookie").unwrap().len(), 2);
            }
            _ => panic!("Expected RequestStart"),
        }
    }

    #[test]
    fn test_unknown_message_rejected() {
        let json = r#"{"type":"shutdown"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
        assert!(serde_json::from_str::<ServerMessage>(json).is_err());
    }
}
