//! Message types for actor communication
//!
//! Every actor is driven through an mpsc command channel. Queries carry a
//! `oneshot` sender for the reply; fire-and-forget commands do not.
//!
//! Pool commands are generic over the connection type because released
//! connections travel back to the pool actor inside the message.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::alerts::{Alert, AlertRule, HistoryFilter, NotificationChannel, RuleStatus};
use crate::error::{AlertError, HealthError, PoolError};

use super::pool::PooledConnection;

/// Commands handled by the pool actor
pub enum PoolCommand<C> {
    /// Hand out a connection, waiting up to `timeout` (pool default if `None`)
    Acquire {
        timeout: Option<Duration>,
        respond_to: oneshot::Sender<Result<PooledConnection<C>, PoolError>>,
    },

    /// A caller returned a connection
    Release { id: u64, conn: C },

    /// A spawned open finished
    Opened {
        ticket: OpenTicket,
        result: anyhow::Result<C>,
    },

    /// A spawned liveness probe finished
    Probed { id: u64, outcome: ProbeOutcome<C> },

    GetStatus {
        respond_to: oneshot::Sender<PoolStatus>,
    },

    /// Run a maintenance pass now; replies once probes are dispatched
    MaintainNow { respond_to: oneshot::Sender<()> },

    /// Stop handing out connections and close everything
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Why a connection is being opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenTicket {
    /// On behalf of the queued waiter with this id
    ForWaiter(u64),
    /// Topping the pool back up to its minimum size
    Replenish,
}

/// Result of probing one idle connection
pub enum ProbeOutcome<C> {
    Healthy(C),
    /// The old connection failed and was replaced by a fresh one
    Replaced(C),
    /// Neither the old connection nor a replacement are usable
    Failed { probe_error: String, connect_error: String },
}

/// Snapshot of the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open connections (idle, in use or being probed)
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    /// Callers queued for a connection
    pub waiting: usize,
    /// Connections currently being opened
    pub pending: usize,
    pub shutting_down: bool,
}

/// Commands handled by a health-check actor
#[derive(Debug)]
pub enum HealthCommand {
    /// Run one check cycle immediately
    CheckNow {
        respond_to: oneshot::Sender<Result<Duration, HealthError>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<HealthStatus>,
    },

    /// Clear all counters without stopping
    Reset,

    /// Restart the timer, checking right away
    Start,

    /// Cancel the timer; statistics stay readable
    Stop,

    /// Stop the actor
    Shutdown,
}

/// Published after every check cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthEvent {
    Healthy { name: String, response_time: Duration },
    Unhealthy { name: String, error: String },
}

/// Rolling statistics of a health check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub name: String,
    pub is_healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub check_count: u64,
    pub failure_count: u64,
    pub uptime: Duration,
    pub average_response_time: Duration,
    /// Percentage of successful cycles, 100 before the first check
    pub success_rate: f64,
    pub response_times: Vec<Duration>,
}

/// Commands handled by the alert actor
#[derive(Debug)]
pub enum AlertCommand {
    AddRule {
        rule: AlertRule,
        respond_to: oneshot::Sender<Result<(), AlertError>>,
    },

    UpdateRule {
        rule: AlertRule,
        respond_to: oneshot::Sender<Result<(), AlertError>>,
    },

    DeleteRule {
        rule_id: String,
        respond_to: oneshot::Sender<Result<(), AlertError>>,
    },

    SetSilenced {
        rule_id: String,
        silenced: bool,
        respond_to: oneshot::Sender<Result<(), AlertError>>,
    },

    AddChannel {
        channel: NotificationChannel,
        respond_to: oneshot::Sender<Result<(), AlertError>>,
    },

    RemoveChannel {
        channel_id: String,
        respond_to: oneshot::Sender<Result<(), AlertError>>,
    },

    SetChannelEnabled {
        channel_id: String,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), AlertError>>,
    },

    GetRules {
        respond_to: oneshot::Sender<Vec<AlertRule>>,
    },

    GetChannels {
        respond_to: oneshot::Sender<Vec<NotificationChannel>>,
    },

    GetActiveAlerts {
        respond_to: oneshot::Sender<Vec<Alert>>,
    },

    GetHistory {
        filter: HistoryFilter,
        respond_to: oneshot::Sender<Vec<Alert>>,
    },

    GetRuleStatus {
        rule_id: String,
        respond_to: oneshot::Sender<Result<RuleStatus, AlertError>>,
    },

    /// Enable the periodic sweep
    StartSweep,

    /// Disable the periodic sweep; event-driven evaluation continues
    StopSweep,

    /// Evaluate every rule now; replies once notifications are dispatched
    SweepNow { respond_to: oneshot::Sender<()> },

    Shutdown,
}
