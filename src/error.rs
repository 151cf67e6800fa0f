//! Domain-specific error types for netsentry.
//!
//! Uses `thiserror` for ergonomic error definitions that integrate
//! with the broader `anyhow` error handling strategy.

use thiserror::Error;

/// Errors that can occur during packet capture operations.
///
/// `PermissionDenied` is fatal to a capture session and is surfaced to the
/// caller without retrying. `Stream` covers mid-session failures of the
/// underlying capture mechanism; the capture loop exits cleanly on it.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("permission denied opening capture device '{device}' (run with root/admin privileges)")]
    PermissionDenied { device: String },

    #[error("failed to open capture device '{device}': {source}")]
    DeviceOpen {
        device: String,
        #[source]
        source: pcap::Error,
    },

    #[error("failed to set capture filter '{filter}': {source}")]
    FilterSet {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    #[error("no suitable capture device found")]
    NoDeviceFound,

    #[error("capture stream failed: {0}")]
    Stream(pcap::Error),
}

/// Errors from the statistical model and its persistence.
///
/// None of these are fatal to a session: a fit failure discards the training
/// buffer and training restarts, a load failure forces retraining, and a save
/// failure leaves the in-memory model usable but unsaved.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model fit failed: {0}")]
    Fit(String),

    #[error("model persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode model: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode model: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("failed to serialize model statistics: {0}")]
    Stats(#[from] serde_json::Error),
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;
