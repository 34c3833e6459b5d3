//! Structured error types for the core.
//!
//! Every error that can cross an op-handler boundary is a [`CoreError`].
//! The retry classifier (see [`crate::backend::retry`]) and the
//! kernel-facing errno mapping both match on `CoreError`'s *kind*, never
//! on a formatted string, per spec section 7 ("classify via structured
//! error inspection (never by string matching)").

use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Transport-level failure categories, independent of which HTTP client
/// produced them. Mirrors the `reqwest`/`hyper` error taxonomy closely
/// enough that `From<reqwest::Error>` can classify without inspecting
/// strings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// TCP connect failed, DNS resolution failed, or the peer reset the
    /// connection.
    ConnectFailed,
    /// The request timed out at the transport layer.
    TimedOut,
    /// Destination host or network was unreachable.
    Unreachable,
    /// Anything else transport-shaped that doesn't fit the above.
    Other,
}

impl TransportKind {
    /// Per spec section 4.5 / section 7: which transport failures are
    /// retryable.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TransportKind::ConnectFailed
                | TransportKind::TimedOut
                | TransportKind::Unreachable
        )
    }
}

/// The structured error type returned by every fallible operation in the
/// core.
#[derive(Error, Diagnostic, Debug)]
pub enum CoreError {
    /// A POSIX errno reported by the server's `fs123-errno` header, or by
    /// a local system call. Surfaced to the kernel unchanged.
    #[error("errno {0}")]
    #[diagnostic(code(fs123_core::errno))]
    Errno(i32),

    /// A non-200/304 HTTP status. Retryable iff 503.
    #[error("http status {status}")]
    #[diagnostic(code(fs123_core::http_status))]
    Http {
        /// The response status code.
        status: u16,
    },

    /// A transient network failure. See [`TransportKind`] for the
    /// retryability rule.
    #[error("transport error: {kind:?}")]
    #[diagnostic(code(fs123_core::transport))]
    Transport {
        /// The classified transport failure.
        kind: TransportKind,
        /// The underlying error, kept for diagnostics only.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Malformed headers, missing required header, checksum mismatch,
    /// magic mismatch, or size inconsistency. Non-retryable; surfaced as
    /// EIO.
    #[error("protocol error: {0}")]
    #[diagnostic(code(fs123_core::protocol))]
    Protocol(String),

    /// The cached inode's identity no longer matches the server's view.
    /// Surfaced to the kernel as ESTALE.
    #[error("stale inode")]
    #[diagnostic(code(fs123_core::stale))]
    Stale,

    /// The server's monotonic validator decreased, which means the
    /// server is faulty (spec section 4.2, protocol >= 7.2).
    #[error("non-monotonic validator")]
    #[diagnostic(code(fs123_core::non_monotonic_validator))]
    NonMonotonicValidator,

    /// Local resource exhaustion: allocation failure, descriptor
    /// exhaustion, or similar.
    #[error("resource exhausted: {0}")]
    #[diagnostic(code(fs123_core::resource))]
    Resource(String),

    /// An I/O error from the local disk cache.
    #[error(transparent)]
    #[diagnostic(code(fs123_core::io))]
    Io(#[from] std::io::Error),

    /// An error constructing or parsing an HTTP request/response.
    #[error(transparent)]
    #[diagnostic(code(fs123_core::http))]
    HttpLib(#[from] http::Error),

    /// An error parsing a URL.
    #[error(transparent)]
    #[diagnostic(code(fs123_core::invalid_url))]
    InvalidUrl(#[from] url::ParseError),

    /// An error converting a header value to a string.
    #[error(transparent)]
    #[diagnostic(code(fs123_core::header_to_str))]
    HeaderToStr(#[from] http::header::ToStrError),
}

impl CoreError {
    /// Maps this error to the POSIX errno the kernel adapter should
    /// report, per spec section 7 ("Propagation"): errors in the
    /// POSIX-errno category are reported with the exact errno; all
    /// others are reported as EIO.
    pub fn to_errno(&self) -> i32 {
        match self {
            CoreError::Errno(e) => *e,
            CoreError::Stale => libc_estale(),
            _ => libc_eio(),
        }
    }

    /// True iff the retry manager (spec section 4.5) should retry this
    /// error.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Http { status } => *status == 503,
            CoreError::Transport { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    /// Builds a [`CoreError::Transport`] from a `reqwest::Error`,
    /// classifying it without ever matching on its `Display` text.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportKind::TimedOut
        } else if err.is_connect() {
            TransportKind::ConnectFailed
        } else if err.is_request() {
            TransportKind::Unreachable
        } else {
            TransportKind::Other
        };
        CoreError::Transport { kind, source: Box::new(err) }
    }
}

// Avoid a hard libc dependency for two constants; these match every
// Unix target fs123 actually runs on.
const fn libc_estale() -> i32 {
    116
}
const fn libc_eio() -> i32 {
    5
}
