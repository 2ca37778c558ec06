//! Streaming HTTP file transfers with progress reporting and cooperative
//! cancellation.
//!
//! # Architecture
//!
//! One [`TransferSession`] performs exactly one upload or one download.
//! Invoking the transfer spawns a tokio task and returns a
//! [`TransferHandle`] immediately; the terminal outcome (success XOR a
//! structured [`TransferError`]) is delivered exactly once through the
//! handle, after every progress event for the session.
//!
//! # Key behaviors
//!
//! - **Streaming**: files move in fixed-size chunks, never fully buffered
//! - **Progress**: observers fire at chunk boundaries and are best-effort;
//!   a panicking observer never fails the transfer
//! - **Cancellation**: [`abort`] is cooperative, checked at each chunk
//!   boundary, and lenient about unknown session ids
//! - **Credentials**: `user:pass@` embedded in a URL becomes a Basic-Auth
//!   header and is stripped before the wire
//!
//! Transfers must be invoked from within a tokio runtime.

mod auth;
mod client;
mod error;
mod options;
mod progress;
mod registry;
mod session;

pub use auth::{basic_auth_header, extract_credentials, strip_credentials};
pub use error::{TransferError, TransferErrorKind};
pub use options::{HttpMethod, NameValue, TransferOptions, to_name_value_pairs};
pub use progress::{ProgressEvent, ProgressObserver, progress_channel};
pub use registry::{SessionId, abort};
pub use session::{
    CHUNK_SIZE, TransferHandle, TransferResult, TransferRole, TransferSession, TransferState,
};

use std::path::PathBuf;

/// Uploads a file to `server_url` on a fresh session without a progress
/// observer. Use [`TransferSession`] directly to observe progress.
pub fn upload(
    file_path: impl Into<PathBuf>,
    server_url: impl Into<String>,
    options: TransferOptions,
) -> TransferHandle {
    TransferSession::new().upload(file_path, server_url, options)
}

/// Downloads `source_url` into `target_path` on a fresh session without a
/// progress observer.
pub fn download(
    source_url: impl Into<String>,
    target_path: impl Into<PathBuf>,
    options: TransferOptions,
) -> TransferHandle {
    TransferSession::new().download(source_url, target_path, options)
}
