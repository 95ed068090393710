use std::path::PathBuf;

/// Curl-equivalent error classes that count as TLS failures for the
/// state-red policy.
pub const STATE_RED_TLS_CODES: &[u32] = &[
    35, 51, 53, 54, 58, 59, 60, 64, 66, 77, 80, 82, 83, 90, 91, 495,
];

/// Errors surfaced by the update engine.
///
/// Synchronous kinds (`InvalidArgs`, `NotRegistered`, `AlreadyRegistered`,
/// `AlreadyInProgress`) are returned from the bus method itself; the rest
/// travel back to clients as terminal signals.
#[derive(Debug, thiserror::Error)]
pub enum UpdaterError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("handle {0} is not registered")]
    NotRegistered(u64),

    #[error("process {process_name:?} is already registered by another caller")]
    AlreadyRegistered { process_name: String },

    #[error("{0} already in progress")]
    AlreadyInProgress(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("platform error: {0}")]
    Platform(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl UpdaterError {
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        UpdaterError::InvalidArgs(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        UpdaterError::Platform(msg.into())
    }

    /// TLS error class carried by this error, when it has one.
    pub fn tls_code(&self) -> Option<u32> {
        match self {
            UpdaterError::Network(NetworkError::Tls { code, .. }) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("TLS failure (class {code}): {message}")]
    Tls { code: u32, message: String },

    #[error("HTTP status {status}")]
    Http { status: u16 },

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),
}

impl NetworkError {
    /// Classifies a reqwest error into the taxonomy.
    ///
    /// reqwest does not expose curl error codes, so TLS failures are
    /// detected from the error chain and reported with class 60 (the peer
    /// certificate class), which is a member of the state-red set.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return NetworkError::Timeout;
        }
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(cause) = source {
            let text = cause.to_string().to_ascii_lowercase();
            if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
                return NetworkError::Tls {
                    code: 60,
                    message: cause.to_string(),
                };
            }
            source = cause.source();
        }
        if err.is_connect() {
            return NetworkError::Connection(err.to_string());
        }
        if let Some(status) = err.status() {
            return NetworkError::Http {
                status: status.as_u16(),
            };
        }
        NetworkError::Connection(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("catalog cache at {path:?} is not parseable")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("catalog cache I/O failure at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog cache lock at {path:?} is held elsewhere")]
    Locked { path: PathBuf },
}
