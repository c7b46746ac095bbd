use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use webhook_tunnel_common::{Result, current_timestamp_millis, headers_to_map};

use super::messages::{HttpRequestStart, HttpResponseStart};
use super::status::Status;

/// Persisted summary of one tunneled request. The etag is bumped on every
/// mutation and drives incremental listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEntry {
    pub request_id: String,
    pub started: i64,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub request_headers: HashMap<String, Vec<String>>,
    pub request_size: i64,
    pub response_status: u16,
    pub response_headers: Option<HashMap<String, Vec<String>>>,
    pub response_size: i64,
    pub error: Option<String>,
    pub completed: Option<i64>,
    pub status: Status,
    pub etag: i64,
}

impl StoreEntry {
    fn estimate_size(&self) -> usize {
        let mut size = self.path.len() + self.method.len() + self.endpoint.len();
        size += header_size(&self.request_headers);
        if let Some(headers) = &self.response_headers {
            size += header_size(headers);
        }
        size + 64
    }
}

fn header_size(headers: &HashMap<String, Vec<String>>) -> usize {
    headers
        .iter()
        .map(|(k, v)| k.len() + v.iter().map(String::len).sum::<usize>())
        .sum()
}

/// Everything the recorder learns about a finished request
#[derive(Debug, Clone)]
pub struct ResponseSummary {
    pub request_size: i64,
    pub response: Option<HttpResponseStart>,
    pub response_size: i64,
    pub error: Option<String>,
    pub status: Status,
}

/// Store for request summary rows. The recorder is the only writer.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert the row for a freshly forwarded request
    async fn log_request(
        &self,
        request_id: &str,
        endpoint: &str,
        request: &HttpRequestStart,
    ) -> Result<()>;

    /// Update the row with the terminal outcome
    async fn log_response(&self, request_id: &str, summary: ResponseSummary) -> Result<()>;

    /// Entries mutated after `etag`, plus the new etag
    async fn entries(&self, etag: i64) -> (Vec<StoreEntry>, i64);

    /// Lookup a single entry by request id
    async fn entry(&self, request_id: &str) -> Option<StoreEntry>;
}

/// In-memory store bounded by entry count and estimated byte size.
/// Oldest entries are evicted first.
pub struct MemoryStore {
    entries: Mutex<VecDeque<StoreEntry>>,
    etag: AtomicI64,
    max_size: usize,
    max_entries: usize,
}

impl MemoryStore {
    pub fn new(max_size: usize, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            etag: AtomicI64::new(0),
            max_size,
            max_entries,
        }
    }

    fn next_etag(&self) -> i64 {
        self.etag.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn ensure_size(entries: &mut VecDeque<StoreEntry>, max_size: usize, max_entries: usize) {
        let mut size: usize = entries.iter().map(StoreEntry::estimate_size).sum();

        while !entries.is_empty() && (entries.len() > max_entries || size > max_size) {
            if let Some(evicted) = entries.pop_front() {
                size -= evicted.estimate_size();
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn log_request(
        &self,
        request_id: &str,
        endpoint: &str,
        request: &HttpRequestStart,
    ) -> Result<()> {
        let entry = StoreEntry {
            request_id: request_id.to_string(),
            started: current_timestamp_millis(),
            endpoint: endpoint.to_string(),
            method: request.method.clone(),
            path: request.path.clone(),
            request_headers: headers_to_map(&request.headers),
            request_size: 0,
            response_status: 0,
            response_headers: None,
            response_size: 0,
            error: None,
            completed: None,
            status: Status::RequestStarted,
            etag: self.next_etag(),
        };

        let mut entries = self.entries.lock();
        entries.push_back(entry);
        Self::ensure_size(&mut entries, self.max_size, self.max_entries);
        Ok(())
    }

    async fn log_response(&self, request_id: &str, summary: ResponseSummary) -> Result<()> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.request_id == request_id) else {
            // The row may already have been evicted; nothing to update.
            return Ok(());
        };

        // A terminal outcome is written once; later updates would only
        // repeat it.
        if entry.status.is_terminal() {
            return Ok(());
        }

        entry.request_size = summary.request_size;
        if let Some(response) = &summary.response {
            entry.response_status = response.status;
            entry.response_headers = Some(headers_to_map(&response.headers));
        }
        entry.response_size = summary.response_size;
        entry.error = summary.error;
        entry.completed = Some(current_timestamp_millis());
        entry.status = summary.status;
        entry.etag = self.etag.fetch_add(1, Ordering::SeqCst) + 1;

        Self::ensure_size(&mut entries, self.max_size, self.max_entries);
        Ok(())
    }

    async fn entries(&self, etag: i64) -> (Vec<StoreEntry>, i64) {
        let entries = self.entries.lock();

        let mut new_etag = etag;
        let mut result = Vec::new();
        for entry in entries.iter() {
            if entry.etag > etag {
                new_etag = new_etag.max(entry.etag);
                result.push(entry.clone());
            }
        }

        (result, new_etag)
    }

    async fn entry(&self, request_id: &str) -> Option<StoreEntry> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.request_id == request_id)
            .cloned()
    }
}
