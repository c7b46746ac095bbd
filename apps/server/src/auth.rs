use http::HeaderMap;
use http::header::AUTHORIZATION;

/// Validate the bearer token an agent presents on the tunnel stream.
/// Without a configured key the tunnel is open.
pub fn agent_token_valid(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };

    match value.strip_prefix("Bearer ") {
        Some(token) => token == expected,
        None => false,
    }
}
