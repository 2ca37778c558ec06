//! Transfer session state machine and the upload/download drivers.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt, stream};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Method, Url};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::error::{TransferError, TransferErrorKind, classify_io, classify_reqwest};
use crate::options::{HttpMethod, TransferOptions, to_name_value_pairs};
use crate::progress::{ProgressEmitter, ProgressObserver};
use crate::registry::{self, SessionId};
use crate::{auth, client};

/// Bytes moved between two cancellation/progress checkpoints. A transfer
/// cannot be interrupted mid-chunk, so this bounds cancellation latency.
pub const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Upload,
    Download,
}

/// Lifecycle of a session. No transition leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferState::Idle | TransferState::InProgress)
    }
}

/// State shared between a session's task and the registry's abort path.
pub(crate) struct SessionShared {
    state: Mutex<TransferState>,
    cancelled: AtomicBool,
}

impl SessionShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TransferState::Idle),
            cancelled: AtomicBool::new(false),
        }
    }

    fn state_lock(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> TransferState {
        *self.state_lock()
    }

    pub(crate) fn is_in_progress(&self) -> bool {
        self.state() == TransferState::InProgress
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Sets the cancellation flag, observed at the next chunk boundary.
    /// Only meaningful while an operation is in flight.
    pub(crate) fn request_abort(&self) {
        if self.is_in_progress() {
            self.cancelled.store(true, Ordering::Relaxed);
        }
    }

    pub(crate) fn begin(&self) {
        *self.state_lock() = TransferState::InProgress;
    }

    pub(crate) fn finish(&self, terminal: TransferState) {
        let mut state = self.state_lock();
        if !state.is_terminal() {
            *state = terminal;
        }
    }
}

/// Terminal success payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub bytes_transferred: u64,
    pub source: String,
    pub target: String,
    pub http_status: u16,
    /// Server response text for uploads; `None` for downloads, whose body
    /// is the target file.
    pub body: Option<String>,
}

/// One upload or download operation.
///
/// Creating a session assigns its id and registers it; invoking `upload`
/// or `download` consumes it, so a second invocation on a live operation
/// is unrepresentable. The transfer runs on its own tokio task and the
/// caller never blocks.
pub struct TransferSession {
    id: SessionId,
    shared: Arc<SessionShared>,
    observer: Option<ProgressObserver>,
}

impl TransferSession {
    pub fn new() -> Self {
        let shared = Arc::new(SessionShared::new());
        let id = registry::register(&shared);
        Self {
            id,
            shared,
            observer: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Registers the progress observer; at most one per session, set
    /// before invoking the transfer.
    pub fn on_progress(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Uploads a local file to `server_url` using a multipart (or raw)
    /// HTTP request. Returns immediately; the outcome arrives through the
    /// handle.
    pub fn upload(
        self,
        file_path: impl Into<PathBuf>,
        server_url: impl Into<String>,
        options: TransferOptions,
    ) -> TransferHandle {
        self.spawn(TransferRole::Upload, file_path.into(), server_url.into(), options)
    }

    /// Streams `source_url` into a local file at `target_path`. Returns
    /// immediately; the outcome arrives through the handle.
    pub fn download(
        self,
        source_url: impl Into<String>,
        target_path: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> TransferHandle {
        self.spawn(TransferRole::Download, target_path.into(), source_url.into(), options)
    }

    fn spawn(
        mut self,
        role: TransferRole,
        path: PathBuf,
        url: String,
        options: TransferOptions,
    ) -> TransferHandle {
        let id = self.id;
        let shared = Arc::clone(&self.shared);
        let observer = self.observer.take();

        shared.begin();
        let emitter = Arc::new(ProgressEmitter::new(observer, Arc::clone(&shared)));
        let (tx, rx) = oneshot::channel();

        tracing::debug!(id, ?role, url = %url, path = %path.display(), "transfer started");
        tokio::spawn(async move {
            let outcome = match role {
                TransferRole::Upload => run_upload(&path, &url, &options, &emitter, &shared).await,
                TransferRole::Download => run_download(&url, &path, &options, &emitter, &shared).await,
            };
            let terminal = match &outcome {
                Ok(_) => TransferState::Completed,
                Err(e) if e.kind == TransferErrorKind::AbortedByUser => TransferState::Aborted,
                Err(_) => TransferState::Failed,
            };
            shared.finish(terminal);
            registry::unregister(id);
            tracing::debug!(id, ?terminal, "transfer finished");
            let _ = tx.send(outcome);
        });

        TransferHandle { id, rx }
    }
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        // A session dropped without being invoked holds no live operation;
        // release its registry slot.
        if self.shared.state() == TransferState::Idle {
            registry::unregister(self.id);
        }
    }
}

/// Handle to an in-flight transfer. The terminal outcome is delivered
/// exactly once, after all progress events for the session.
pub struct TransferHandle {
    id: SessionId,
    rx: oneshot::Receiver<Result<TransferResult, TransferError>>,
}

impl TransferHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Resolves the terminal outcome. Success and error are mutually
    /// exclusive by construction.
    pub async fn wait(self) -> Result<TransferResult, TransferError> {
        self.rx.await.unwrap_or_else(|_| {
            Err(TransferError::new(TransferErrorKind::Unknown)
                .with_cause("transfer task dropped before completing"))
        })
    }
}

async fn run_upload(
    file_path: &Path,
    server_url: &str,
    options: &TransferOptions,
    emitter: &Arc<ProgressEmitter>,
    shared: &Arc<SessionShared>,
) -> Result<TransferResult, TransferError> {
    let (url, auth_header) = auth::take_url_credentials(server_url);
    let source = file_path.display().to_string();

    let err = |kind: TransferErrorKind, cause: String| {
        TransferError::new(kind)
            .with_locators(source.clone(), url.clone())
            .with_cause(cause)
    };
    let net = |e: reqwest::Error| {
        if shared.is_cancelled() {
            err(TransferErrorKind::AbortedByUser, "transfer aborted".to_string())
        } else {
            err(classify_reqwest(&e), e.to_string())
        }
    };

    let parsed = Url::parse(&url).map_err(|e| err(TransferErrorKind::InvalidUrl, e.to_string()))?;

    let file = File::open(file_path)
        .await
        .map_err(|e| err(classify_io(&e), e.to_string()))?;
    let total = file
        .metadata()
        .await
        .map_err(|e| err(classify_io(&e), e.to_string()))?
        .len();

    let client = client::build(options).map_err(|e| err(classify_reqwest(&e), e.to_string()))?;

    let headers = build_header_map(&options.headers, auth_header)
        .map_err(|cause| err(TransferErrorKind::Unknown, cause))?;

    let method = match options.method() {
        HttpMethod::Put => Method::PUT,
        HttpMethod::Post => Method::POST,
    };
    let body = Body::wrap_stream(chunk_stream(
        file,
        total,
        Arc::clone(emitter),
        Arc::clone(shared),
    ));

    let request = client.request(method, parsed).headers(headers);
    let request = match &options.file_key {
        Some(file_key) => {
            let file_name = options
                .file_name
                .clone()
                .unwrap_or_else(|| default_file_name(file_path));
            let part = if options.chunked_mode {
                Part::stream(body)
            } else {
                Part::stream_with_length(body, total)
            };
            let part = part
                .file_name(file_name)
                .mime_str(&options.mime_type)
                .map_err(|e| err(TransferErrorKind::Unknown, e.to_string()))?;

            let mut form = Form::new();
            for field in to_name_value_pairs(&options.params) {
                form = form.text(field.name, field.value);
            }
            request.multipart(form.part(file_key.clone(), part))
        }
        None => {
            let request = if options.chunked_mode {
                request
            } else {
                request.header(CONTENT_LENGTH, total)
            };
            request.body(body)
        }
    };

    let response = request.send().await.map_err(&net)?;
    let status = response.status();
    let body_text = response.text().await.map_err(&net)?;

    if !status.is_success() {
        return Err(err(
            TransferErrorKind::UnexpectedHttpStatus,
            format!("server returned {status}"),
        )
        .with_status(status.as_u16())
        .with_body(body_text));
    }

    Ok(TransferResult {
        bytes_transferred: emitter.loaded(),
        source: source.clone(),
        target: url.clone(),
        http_status: status.as_u16(),
        body: Some(body_text),
    })
}

async fn run_download(
    source_url: &str,
    target_path: &Path,
    options: &TransferOptions,
    emitter: &Arc<ProgressEmitter>,
    shared: &Arc<SessionShared>,
) -> Result<TransferResult, TransferError> {
    let (url, auth_header) = auth::take_url_credentials(source_url);
    let target = target_path.display().to_string();

    let err = |kind: TransferErrorKind, cause: String| {
        TransferError::new(kind)
            .with_locators(url.clone(), target.clone())
            .with_cause(cause)
    };
    let net = |e: reqwest::Error| {
        if shared.is_cancelled() {
            err(TransferErrorKind::AbortedByUser, "transfer aborted".to_string())
        } else {
            err(classify_reqwest(&e), e.to_string())
        }
    };

    let parsed = Url::parse(&url).map_err(|e| err(TransferErrorKind::InvalidUrl, e.to_string()))?;

    let client = client::build(options).map_err(|e| err(classify_reqwest(&e), e.to_string()))?;
    let headers = build_header_map(&options.headers, auth_header)
        .map_err(|cause| err(TransferErrorKind::Unknown, cause))?;

    let response = client.get(parsed).headers(headers).send().await.map_err(&net)?;
    let status = response.status();

    if !status.is_success() {
        // No file is created for a failed response, so nothing is left
        // open or partially written.
        let body_text = response.text().await.unwrap_or_default();
        return Err(err(
            TransferErrorKind::UnexpectedHttpStatus,
            format!("server returned {status}"),
        )
        .with_status(status.as_u16())
        .with_body(body_text));
    }

    let total = response.content_length();
    let mut file = File::create(target_path)
        .await
        .map_err(|e| err(classify_io(&e), e.to_string()))?;

    let streamed: Result<(), TransferError> = async {
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.try_next().await.map_err(&net)? {
            if shared.is_cancelled() {
                return Err(err(
                    TransferErrorKind::AbortedByUser,
                    "transfer aborted".to_string(),
                ));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| err(classify_io(&e), e.to_string()))?;
            emitter.add(chunk.len() as u64, total);
        }
        file.sync_all()
            .await
            .map_err(|e| err(classify_io(&e), e.to_string()))?;
        Ok(())
    }
    .await;

    // The handle is closed on every path before the partial file is
    // touched again.
    drop(file);

    match streamed {
        Ok(()) => Ok(TransferResult {
            bytes_transferred: emitter.loaded(),
            source: url.clone(),
            target: target.clone(),
            http_status: status.as_u16(),
            body: None,
        }),
        Err(error) => {
            if let Err(e) = tokio::fs::remove_file(target_path).await {
                tracing::warn!(path = %target_path.display(), error = %e, "failed to remove partial download");
            }
            Err(error)
        }
    }
}

/// Streams the file in [`CHUNK_SIZE`] chunks, emitting progress and
/// honoring the abort flag at each chunk boundary.
fn chunk_stream(
    file: File,
    total: u64,
    emitter: Arc<ProgressEmitter>,
    shared: Arc<SessionShared>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    struct ChunkState {
        file: File,
        total: u64,
        emitter: Arc<ProgressEmitter>,
        shared: Arc<SessionShared>,
        failed: bool,
    }

    let state = ChunkState {
        file,
        total,
        emitter,
        shared,
        failed: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.failed {
            return None;
        }
        if st.shared.is_cancelled() {
            st.failed = true;
            return Some((
                Err(io::Error::new(io::ErrorKind::Interrupted, "transfer aborted")),
                st,
            ));
        }
        let mut buf = vec![0u8; CHUNK_SIZE];
        match st.file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                st.emitter.add(n as u64, Some(st.total));
                Some((Ok(Bytes::from(buf)), st))
            }
            Err(e) => {
                st.failed = true;
                Some((Err(e), st))
            }
        }
    })
}

fn build_header_map(
    extra: &Map<String, Value>,
    auth_header: Option<(String, String)>,
) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    for pair in to_name_value_pairs(extra) {
        let name = HeaderName::from_bytes(pair.name.as_bytes())
            .map_err(|e| format!("invalid header name {:?}: {e}", pair.name))?;
        let value = HeaderValue::from_str(&pair.value)
            .map_err(|e| format!("invalid header value for {:?}: {e}", pair.name))?;
        headers.append(name, value);
    }
    if let Some((_, value)) = auth_header {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| format!("invalid credential bytes: {e}"))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

fn default_file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::io::Write as _;

    #[test]
    fn terminal_states_are_sticky() {
        let shared = SessionShared::new();
        shared.begin();
        shared.finish(TransferState::Aborted);
        shared.finish(TransferState::Completed);
        assert_eq!(shared.state(), TransferState::Aborted);
    }

    #[test]
    fn abort_requires_in_flight_operation() {
        let shared = SessionShared::new();
        shared.request_abort();
        assert!(!shared.is_cancelled());

        shared.begin();
        shared.request_abort();
        assert!(shared.is_cancelled());
    }

    #[test]
    fn terminal_classification() {
        assert!(!TransferState::Idle.is_terminal());
        assert!(!TransferState::InProgress.is_terminal());
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Failed.is_terminal());
        assert!(TransferState::Aborted.is_terminal());
    }

    #[test]
    fn dropped_idle_session_leaves_registry() {
        let session = TransferSession::new();
        let id = session.id();
        drop(session);
        assert!(registry::find(id).is_none());
    }

    #[test]
    fn default_file_name_falls_back() {
        assert_eq!(default_file_name(Path::new("/tmp/photo.jpg")), "photo.jpg");
        assert_eq!(default_file_name(Path::new("/")), "file");
    }

    #[test]
    fn header_map_preserves_extras_and_auth() {
        let extra = json!({"X-Token": "abc", "X-Trace": "1"})
            .as_object()
            .cloned()
            .expect("object");
        let headers = build_header_map(
            &extra,
            Some(("Authorization".to_string(), "Basic dXNlcjpwYXNz".to_string())),
        )
        .expect("valid headers");
        assert_eq!(headers.len(), 3);
        assert_eq!(headers["x-token"], "abc");
        assert_eq!(headers["authorization"], "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn header_map_rejects_invalid_names() {
        let extra = json!({"bad header": "x"}).as_object().cloned().expect("object");
        assert!(build_header_map(&extra, None).is_err());
    }

    #[tokio::test]
    async fn chunk_stream_reads_whole_file_with_progress() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        let data = vec![7u8; CHUNK_SIZE * 2 + 512];
        tmp.write_all(&data).expect("write fixture");

        let shared = Arc::new(SessionShared::new());
        shared.begin();
        let (observer, mut events) = crate::progress::progress_channel();
        let emitter = Arc::new(ProgressEmitter::new(Some(observer), Arc::clone(&shared)));

        let file = File::open(tmp.path()).await.expect("open fixture");
        let chunks: Vec<_> = chunk_stream(file, data.len() as u64, Arc::clone(&emitter), shared)
            .collect()
            .await;

        let total: usize = chunks
            .iter()
            .map(|c| c.as_ref().expect("chunk ok").len())
            .sum();
        assert_eq!(total, data.len());
        assert_eq!(chunks.len(), 3);
        assert_eq!(emitter.loaded(), data.len() as u64);
        drop(emitter);

        let mut last = 0;
        while let Some(event) = events.recv().await {
            assert!(event.loaded > last);
            assert!(event.length_computable);
            assert_eq!(event.total, data.len() as u64);
            last = event.loaded;
        }
        assert_eq!(last, data.len() as u64);
    }

    #[tokio::test]
    async fn chunk_stream_stops_at_abort_flag() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        tmp.write_all(&vec![1u8; CHUNK_SIZE * 4]).expect("write fixture");

        let shared = Arc::new(SessionShared::new());
        shared.begin();
        shared.request_abort();
        let emitter = Arc::new(ProgressEmitter::new(None, Arc::clone(&shared)));

        let file = File::open(tmp.path()).await.expect("open fixture");
        let chunks: Vec<_> = chunk_stream(file, 0, emitter, shared).collect().await;

        assert_eq!(chunks.len(), 1);
        let error = chunks[0].as_ref().expect_err("aborted stream errors");
        assert_eq!(error.kind(), io::ErrorKind::Interrupted);
    }
}
