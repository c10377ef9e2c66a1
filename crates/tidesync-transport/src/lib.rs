//! # TideSync Transport
//!
//! Authenticated HTTP transport to the share store.
//!
//! Structured endpoints live under `/api/v1/sync` and speak JSON; file
//! bodies move through the WebDAV subset under `/dav/{share_id}` (GET
//! with ranges, PUT, DELETE, MKCOL, MOVE, PROPFIND). Authentication is a
//! short-lived bearer token; a 401 triggers exactly one refresh attempt,
//! serialized across concurrent requests so only one refresh is ever in
//! flight.
//!
//! The whole endpoint surface is abstracted behind [`RemoteStore`] so the
//! engine can run against an in-memory remote in tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod client;
pub mod remote;
pub mod throttle;
pub mod types;

pub use client::{SyncClient, TransportConfig};
pub use remote::RemoteStore;
pub use types::{
    BlockHashResponse, ChangeAction, ChangesResponse, EntryKind, FileChange, RefreshRequest,
    RefreshResponse, RemoteMetadata, Share, SyncConfigDoc, SyncStateDoc,
};

use thiserror::Error;

/// Errors produced by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Token rejected and the refresh attempt failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network-level failure (connect, timeout, body read).
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with an unexpected status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code.
        status: u16,
        /// Response body or status text.
        message: String,
    },

    /// The response did not parse as the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether a retry with backoff is worthwhile.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Auth(_) | Self::Protocol(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
