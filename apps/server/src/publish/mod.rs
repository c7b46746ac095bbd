//! The publish/tunnel core: endpoint registry, per-request event bus and
//! the recorder that persists request summaries and bodies.

mod buckets;
mod messages;
mod publisher;
mod recorder;
mod request;
mod status;
mod store;

pub use buckets::{BlobWriter, Buckets, FsBuckets};
pub use messages::{HttpData, HttpError, HttpRequestStart, HttpResponseStart};
pub use publisher::{Publisher, RequestHandler};
pub use recorder::Recorder;
pub use request::{
    ORIGIN_AGENT, ORIGIN_INGRESS, ORIGIN_RECORDER, Origin, RequestListener, TunneledRequest,
};
pub use status::Status;
pub use store::{MemoryStore, ResponseSummary, Store, StoreEntry};
