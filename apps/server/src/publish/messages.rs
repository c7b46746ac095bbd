use bytes::Bytes;
use http::HeaderMap;

/// Immutable description of an inbound request, captured at the ingress
#[derive(Debug, Clone)]
pub struct HttpRequestStart {
    /// Path below the endpoint, including the query string
    pub path: String,

    /// The request method
    pub method: String,

    /// The request headers
    pub headers: HeaderMap,
}

/// One body chunk in either direction
#[derive(Debug, Clone)]
pub struct HttpData {
    /// The chunk, possibly empty
    pub data: Bytes,

    /// Marks the end of the stream for this direction
    pub completed: bool,
}

/// Status line and headers of the response produced by the agent
#[derive(Debug, Clone)]
pub struct HttpResponseStart {
    /// The response headers
    pub headers: HeaderMap,

    /// The status code
    pub status: u16,
}

/// Terminal failure of a tunneled request
#[derive(Debug, Clone)]
pub struct HttpError {
    /// Error text, if any. `timeout` with no text is a cancellation.
    pub error: Option<String>,

    /// Indicates that the request was cancelled or timed out
    pub timeout: bool,
}
