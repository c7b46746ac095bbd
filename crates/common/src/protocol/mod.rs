mod message;

pub use message::{ClientMessage, ServerMessage};
