//! Typed errors for the pieces of the pipeline that callers need to match on.
//!
//! Everything else (scheduler glue, asset-source transport) propagates
//! `anyhow::Error`, mixing `anyhow` for operational code with small
//! `thiserror` enums at the seams that matter.

use std::net::AddrParseError;

use thiserror::Error;

/// Errors produced by [`crate::unit::Unit::parse`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("suffix {0:?} does not match expected unit {1:?}")]
    Mismatch(String, String),
    #[error("malformed numeric magnitude: {0:?}")]
    Malformed(String),
}

/// Errors produced while turning an [`crate::assets::Asset`] into an
/// [`crate::registry::EndpointCandidate`].
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("asset has no hostname")]
    NoHostname,
    #[error("port {0:?} is not a valid port number")]
    BadPort(String),
    #[error("failed to resolve {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("host {0} resolved to no usable IPv4 or IPv6 address")]
    NoAddress(String),
}

/// Errors produced by [`crate::prober::Prober::probe`].
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("relay handshake failed: {0}")]
    Handshake(#[source] anyhow::Error),
    #[error("expected a server-info message, got something else")]
    UnexpectedMessage,
    #[error("relay session I/O error: {0}")]
    Io(#[source] anyhow::Error),
    #[error("no packets received before the measurement window expired")]
    NoPackets,
    #[error("probe aborted by shutdown cancellation")]
    Cancelled,
}

/// Errors produced while loading [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration for {key}: {source}")]
    InvalidDuration {
        key: &'static str,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid listen address {0:?}: {1}")]
    InvalidAddress(String, #[source] AddrParseError),
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Errors surfaced to HTTP clients, mapped onto the [`crate::http::ApiError`]
/// response body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown status {0:?}")]
    UnknownStatus(String),
    #[error("invalid latency-limit: {0}")]
    InvalidLatencyLimit(#[source] humantime::DurationError),
    #[error("invalid bandwidth-limit: {0}")]
    InvalidBandwidthLimit(#[source] UnitError),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}
