use base64::{Engine as _, engine::general_purpose::STANDARD};

/// Encode a body chunk for the JSON wire format
pub fn encode_body(body: &[u8]) -> String {
    STANDARD.encode(body)
}

/// Decode a body chunk received over the wire
pub fn decode_body(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}
