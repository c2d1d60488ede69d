//! Error types for the pool, metrics, health-check and alerting layers
//!
//! Capacity and configuration errors are returned synchronously to the caller.
//! Everything that happens inside background loops (reconnects, notification
//! delivery) is logged and published as an event instead.

use std::time::Duration;

use thiserror::Error;

use crate::metrics::MetricKind;

/// Errors returned by [`crate::actors::pool::Pool`]
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available before the deadline
    #[error("timed out after {0:?} waiting for a pooled connection")]
    Timeout(Duration),

    /// The pool is shutting down or has already shut down
    #[error("connection pool is shutting down")]
    ShuttingDown,

    /// The connection factory failed to open a connection
    #[error("failed to open connection: {0:#}")]
    Connect(anyhow::Error),

    #[error("invalid pool options: {0}")]
    InvalidOptions(String),
}

/// Errors returned by [`crate::metrics::MetricsCollector`]
#[derive(Debug, Error, PartialEq)]
pub enum MetricsError {
    #[error("metric `{0}` is already registered")]
    AlreadyRegistered(String),

    #[error("metric `{0}` is not registered")]
    UnknownMetric(String),

    #[error("metric `{name}` is a {actual}, not a {expected}")]
    KindMismatch {
        name: String,
        expected: MetricKind,
        actual: MetricKind,
    },

    #[error("metric `{metric}` has no label named `{label}`")]
    UnknownLabel { metric: String, label: String },

    #[error("invalid value {value} for metric `{metric}`")]
    InvalidValue { metric: String, value: f64 },

    #[error("histogram `{0}` needs strictly increasing bucket bounds")]
    InvalidBuckets(String),
}

/// Errors returned by [`crate::actors::alert::AlertHandle`]
#[derive(Debug, Error, PartialEq)]
pub enum AlertError {
    #[error("alert rule `{0}` already exists")]
    DuplicateRule(String),

    #[error("alert rule `{0}` does not exist")]
    UnknownRule(String),

    #[error("notification channel `{0}` already exists")]
    DuplicateChannel(String),

    #[error("notification channel `{0}` does not exist")]
    UnknownChannel(String),

    /// The alert actor is no longer running
    #[error("alert manager is not running")]
    Unavailable,
}

/// Outcome of a single failed health-check cycle
#[derive(Debug, Error, Clone)]
pub enum HealthError {
    #[error("health check timed out after {0:?}")]
    Timeout(Duration),

    #[error("health check failed: {0}")]
    Probe(String),

    /// The health-check actor is no longer running
    #[error("health check `{0}` is stopped")]
    Stopped(String),
}
