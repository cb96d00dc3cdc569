//! Error taxonomy for the depot engine.
//!
//! Store and network failures are caught at the `CatalogStore` /
//! `RegistryClient` boundaries and reduced to boolean / optional "no result"
//! signals with a log entry; only `Busy` and `Validation` cross those
//! boundaries so callers can distinguish them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DepotError {
    /// Malformed or empty identifiers, rejected before any I/O.
    #[error("validation error: {0}")]
    Validation(String),

    /// Index migration or transaction failure. The store is rolled back to
    /// its last consistent version.
    #[error("store error: {0}")]
    Store(String),

    /// Remote registry failure, with the HTTP status when one was received.
    #[error("network error ({kind:?}{}): {message}", status.map(|s| format!(", status {s}")).unwrap_or_default())]
    Network {
        kind: NetworkErrorKind,
        status: Option<u16>,
        message: String,
    },

    /// A request is already in flight on this client instance.
    #[error("a registry request is already in flight")]
    Busy,

    /// No artifact matched the given identifiers.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of remote registry failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    AuthRequired,
    ConnectionRefused,
    MalformedContent,
    HostNotFound,
    TlsUnavailable,
    Other,
}

impl From<rusqlite::Error> for DepotError {
    fn from(e: rusqlite::Error) -> Self {
        DepotError::Store(e.to_string())
    }
}

impl DepotError {
    /// Classify a reqwest failure into the network taxonomy.
    pub(crate) fn from_reqwest(e: &reqwest::Error) -> Self {
        let status = e.status().map(|s| s.as_u16());
        let kind = if matches!(status, Some(401) | Some(403)) {
            NetworkErrorKind::AuthRequired
        } else if e.is_decode() || e.is_body() {
            NetworkErrorKind::MalformedContent
        } else if e.is_connect() {
            // reqwest folds DNS and TLS failures into connect errors; the
            // source chain is the only place they can be told apart.
            let chain = source_chain(e);
            if chain.contains("dns") || chain.contains("resolve") {
                NetworkErrorKind::HostNotFound
            } else if chain.contains("tls") || chain.contains("certificate") || chain.contains("handshake") {
                NetworkErrorKind::TlsUnavailable
            } else {
                NetworkErrorKind::ConnectionRefused
            }
        } else {
            NetworkErrorKind::Other
        };

        DepotError::Network {
            kind,
            status,
            message: e.to_string(),
        }
    }

    /// Network error for a non-success HTTP status.
    pub(crate) fn from_status(status: reqwest::StatusCode) -> Self {
        let kind = match status.as_u16() {
            401 | 403 => NetworkErrorKind::AuthRequired,
            _ => NetworkErrorKind::Other,
        };
        DepotError::Network {
            kind,
            status: Some(status.as_u16()),
            message: format!("registry returned HTTP {status}"),
        }
    }
}

fn source_chain(e: &reqwest::Error) -> String {
    let mut chain = String::new();
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(e);
    while let Some(err) = source {
        chain.push_str(&err.to_string().to_lowercase());
        chain.push(' ');
        source = err.source();
    }
    chain
}

pub type Result<T> = std::result::Result<T, DepotError>;
