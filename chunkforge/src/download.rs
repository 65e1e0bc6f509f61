//! Download service abstraction.
//!
//! The chunk source only needs "fetch these bytes, tell me when done", so
//! the transport sits behind a trait. This enables dependency injection and
//! mock services in tests; the real implementation rides on a blocking
//! reqwest client with one worker thread per request.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Identifier of one issued download request.
pub type RequestId = u64;

/// Result of a completed (or failed) download request.
#[derive(Debug, Clone)]
pub struct Download {
    /// The request this result belongs to.
    pub request_id: RequestId,
    /// Effective URL that was fetched.
    pub url: String,
    /// Whether the transfer completed with a success status.
    pub success: bool,
    /// HTTP status code, or 0 when the request never got a response.
    pub status_code: u16,
    /// Response body; empty on failure.
    pub data: Vec<u8>,
    /// Wall time the transfer took.
    pub elapsed: Duration,
}

impl Download {
    pub fn was_successful(&self) -> bool {
        self.success
    }

    /// A failure result carrying connection diagnostics but no data.
    pub fn failed(request_id: RequestId, url: String, status_code: u16, elapsed: Duration) -> Self {
        Self {
            request_id,
            url,
            success: false,
            status_code,
            data: Vec::new(),
            elapsed,
        }
    }
}

/// Callback invoked exactly once when a request finishes.
pub type DownloadCompleteCallback = Box<dyn FnOnce(Download) + Send>;

/// Abstract download transport.
pub trait DownloadService: Send + Sync {
    /// Issue an asynchronous download of `url`. The callback fires on an
    /// arbitrary thread when the transfer completes or fails.
    fn request_file(&self, url: String, on_complete: DownloadCompleteCallback) -> RequestId;

    /// Request cancellation of an in-flight download. Best effort: the
    /// completion callback still fires, with a failure result.
    fn cancel(&self, request_id: RequestId);
}

/// Default HTTP request timeout.
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;

/// Cancellation bookkeeping shared with the per-request worker threads.
///
/// Both sets only hold ids of requests still in flight: the worker removes
/// its id from both on completion, and `cancel` ignores ids that are no
/// longer active, so neither set grows past the concurrent request count.
#[derive(Default)]
struct RequestState {
    active: HashSet<RequestId>,
    cancelled: HashSet<RequestId>,
}

/// `DownloadService` over a blocking reqwest client.
pub struct HttpDownloadService {
    client: reqwest::blocking::Client,
    next_request_id: AtomicU64,
    state: Arc<Mutex<RequestState>>,
}

impl HttpDownloadService {
    pub fn new() -> reqwest::Result<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            next_request_id: AtomicU64::new(1),
            state: Arc::new(Mutex::new(RequestState::default())),
        })
    }

    #[cfg(test)]
    fn tracked_request_count(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.active.len(), state.cancelled.len())
    }

    fn fetch(client: &reqwest::blocking::Client, request_id: RequestId, url: &str) -> Download {
        let started = Instant::now();
        match client.get(url).send() {
            Ok(response) => {
                let status_code = response.status().as_u16();
                if !response.status().is_success() {
                    tracing::debug!(url, status_code, "download returned error status");
                    return Download::failed(
                        request_id,
                        url.to_string(),
                        status_code,
                        started.elapsed(),
                    );
                }
                match response.bytes() {
                    Ok(body) => Download {
                        request_id,
                        url: url.to_string(),
                        success: true,
                        status_code,
                        data: body.to_vec(),
                        elapsed: started.elapsed(),
                    },
                    Err(e) => {
                        tracing::debug!(url, error = %e, "failed to read download body");
                        Download::failed(request_id, url.to_string(), status_code, started.elapsed())
                    }
                }
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "download request failed");
                Download::failed(request_id, url.to_string(), 0, started.elapsed())
            }
        }
    }
}

impl DownloadService for HttpDownloadService {
    fn request_file(&self, url: String, on_complete: DownloadCompleteCallback) -> RequestId {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let client = self.client.clone();
        let state = Arc::clone(&self.state);
        self.state.lock().active.insert(request_id);

        thread::spawn(move || {
            let result = Self::fetch(&client, request_id, &url);
            // A cancellation that raced the transfer turns the result into
            // a failure so the scheduler's retry path owns what happens next.
            let was_cancelled = {
                let mut state = state.lock();
                state.active.remove(&request_id);
                state.cancelled.remove(&request_id)
            };
            if was_cancelled {
                on_complete(Download::failed(request_id, url, 0, result.elapsed));
            } else {
                on_complete(result);
            }
        });

        request_id
    }

    fn cancel(&self, request_id: RequestId) {
        let mut state = self.state.lock();
        // A cancel that arrives after completion has nothing to mark.
        if state.active.contains(&request_id) {
            state.cancelled.insert(request_id);
        }
    }
}
