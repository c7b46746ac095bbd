use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use uuid::Uuid;

/// Generate a unique request identifier using UUID v4
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a random endpoint name for agents that did not pick one
/// Format: 12 lowercase alphanumeric characters
pub fn generate_endpoint_name() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(|c| c.to_ascii_lowercase())
        .map(char::from)
        .collect()
}
