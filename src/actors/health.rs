//! HealthCheckActor - Periodically runs a liveness probe
//!
//! Every cycle races the probe against a timeout and retries a bounded number
//! of times before declaring the cycle failed:
//!
//! ```text
//! attempt 0 ──fail──▶ sleep(retry_delay) ──▶ attempt 1 ──fail──▶ ... ──▶ attempt N ──fail──▶ Unhealthy
//!     │                                          │                          │
//!     └──ok──────────────────────────────────────┴──────────────────────────┴──ok──▶ Healthy(elapsed)
//! ```
//!
//! The reported response time spans the whole cycle, retries included. The
//! retry loop is also exposed as [`execute_with_retry`] so the pool can probe
//! single connections with the same policy.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, timeout};
use tracing::{debug, instrument, trace, warn};

use crate::error::HealthError;

use super::messages::{HealthCommand, HealthEvent, HealthStatus};

/// Number of response times kept for the rolling average
pub const RESPONSE_TIME_HISTORY: usize = 100;

/// A liveness probe. `Ok` means healthy.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    async fn check(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Probe for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn check(&self) -> anyhow::Result<()> {
        (self)().await
    }
}

/// Timeout and retry settings of a single check cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub timeout: Duration,
    /// Extra attempts after the first failure
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Runtime options of a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckOptions {
    pub interval: Duration,
    pub policy: ProbePolicy,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            policy: ProbePolicy::default(),
        }
    }
}

/// Run `attempt` until it succeeds, at most `retry_count + 1` times
///
/// Each attempt is bounded by `policy.timeout`; a timed out attempt is
/// dropped. Returns the elapsed time of the whole cycle on success and the
/// last error otherwise.
pub async fn execute_with_retry<F, Fut>(
    policy: &ProbePolicy,
    mut attempt: F,
) -> Result<Duration, HealthError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let started = Instant::now();
    let mut last_error = HealthError::Timeout(policy.timeout);

    for round in 0..=policy.retry_count {
        match timeout(policy.timeout, attempt()).await {
            Ok(Ok(())) => return Ok(started.elapsed()),
            Ok(Err(err)) => last_error = HealthError::Probe(format!("{err:#}")),
            Err(_) => last_error = HealthError::Timeout(policy.timeout),
        }

        if round < policy.retry_count {
            trace!("attempt {round} failed ({last_error}), retrying");
            sleep(policy.retry_delay).await;
        }
    }

    Err(last_error)
}

#[derive(Debug)]
struct HealthStats {
    started_at: Instant,
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
    check_count: u64,
    failure_count: u64,
    response_times: VecDeque<Duration>,
}

impl HealthStats {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_check: None,
            last_error: None,
            check_count: 0,
            failure_count: 0,
            response_times: VecDeque::with_capacity(RESPONSE_TIME_HISTORY),
        }
    }

    fn record(&mut self, outcome: &Result<Duration, HealthError>) {
        self.check_count += 1;
        self.last_check = Some(Utc::now());

        match outcome {
            Ok(response_time) => {
                self.last_error = None;
                self.response_times.push_back(*response_time);
                if self.response_times.len() > RESPONSE_TIME_HISTORY {
                    self.response_times.pop_front();
                }
            }
            Err(err) => {
                self.failure_count += 1;
                self.last_error = Some(err.to_string());
            }
        }
    }

    fn average_response_time(&self) -> Duration {
        if self.response_times.is_empty() {
            return Duration::ZERO;
        }
        self.response_times.iter().sum::<Duration>() / self.response_times.len() as u32
    }

    fn success_rate(&self) -> f64 {
        if self.check_count == 0 {
            return 100.0;
        }
        (self.check_count - self.failure_count) as f64 / self.check_count as f64 * 100.0
    }

    fn status(&self, name: &str) -> HealthStatus {
        HealthStatus {
            name: name.to_string(),
            is_healthy: self.last_error.is_none(),
            last_check: self.last_check,
            last_error: self.last_error.clone(),
            check_count: self.check_count,
            failure_count: self.failure_count,
            uptime: self.started_at.elapsed(),
            average_response_time: self.average_response_time(),
            success_rate: self.success_rate(),
            response_times: self.response_times.iter().copied().collect(),
        }
    }
}

/// Actor that owns one probe and its statistics
pub struct HealthCheckActor<P: Probe> {
    name: String,
    options: HealthCheckOptions,
    probe: Arc<P>,
    stats: HealthStats,
    /// Whether the interval timer is armed
    running: bool,
    command_rx: mpsc::Receiver<HealthCommand>,
    event_tx: broadcast::Sender<HealthEvent>,
}

impl<P: Probe> HealthCheckActor<P> {
    fn new(
        name: String,
        options: HealthCheckOptions,
        probe: P,
        command_rx: mpsc::Receiver<HealthCommand>,
        event_tx: broadcast::Sender<HealthEvent>,
    ) -> Self {
        Self {
            name,
            options,
            probe: Arc::new(probe),
            stats: HealthStats::new(),
            running: true,
            command_rx,
            event_tx,
        }
    }

    #[instrument(skip(self), fields(check = %self.name))]
    async fn run(mut self) {
        debug!("starting health check actor");

        // first tick fires immediately
        let mut ticker = interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick(), if self.running => {
                    let _ = self.check().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        HealthCommand::CheckNow { respond_to } => {
                            let outcome = self.check().await;
                            let _ = respond_to.send(outcome);
                        }

                        HealthCommand::GetStatus { respond_to } => {
                            let _ = respond_to.send(self.stats.status(&self.name));
                        }

                        HealthCommand::Reset => {
                            debug!("resetting health statistics");
                            self.stats = HealthStats::new();
                        }

                        HealthCommand::Start => {
                            debug!("restarting check timer");
                            self.running = true;
                            ticker.reset_immediately();
                        }

                        HealthCommand::Stop => {
                            debug!("stopping check timer");
                            self.running = false;
                        }

                        HealthCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("health check actor stopped");
    }

    async fn check(&mut self) -> Result<Duration, HealthError> {
        let probe = Arc::clone(&self.probe);
        let outcome = execute_with_retry(&self.options.policy, || probe.check()).await;
        self.stats.record(&outcome);

        let event = match &outcome {
            Ok(response_time) => {
                trace!("healthy after {response_time:?}");
                HealthEvent::Healthy {
                    name: self.name.clone(),
                    response_time: *response_time,
                }
            }
            Err(err) => {
                warn!("{} is unhealthy: {err}", self.name);
                HealthEvent::Unhealthy {
                    name: self.name.clone(),
                    error: err.to_string(),
                }
            }
        };

        // no listeners is fine
        let _ = self.event_tx.send(event);
        outcome
    }
}

/// Handle for controlling a HealthCheckActor
#[derive(Clone)]
pub struct HealthCheckHandle {
    name: String,
    options: HealthCheckOptions,
    sender: mpsc::Sender<HealthCommand>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthCheckHandle {
    /// Spawn the actor; the first check runs right away
    pub fn start<P: Probe>(name: impl Into<String>, options: HealthCheckOptions, probe: P) -> Self {
        let name = name.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(64);

        let actor = HealthCheckActor::new(name.clone(), options, probe, cmd_rx, event_tx.clone());
        tokio::spawn(actor.run());

        Self {
            name,
            options,
            sender: cmd_tx,
            events: event_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configuration(&self) -> &HealthCheckOptions {
        &self.options
    }

    /// Receive a `HealthEvent` after every cycle
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Run one cycle now and return its outcome
    pub async fn check_now(&self) -> Result<Duration, HealthError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HealthCommand::CheckNow { respond_to: tx })
            .await
            .map_err(|_| HealthError::Stopped(self.name.clone()))?;

        rx.await
            .map_err(|_| HealthError::Stopped(self.name.clone()))?
    }

    /// Current statistics, `None` once the actor shut down
    pub async fn status(&self) -> Option<HealthStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HealthCommand::GetStatus { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    pub async fn reset(&self) {
        let _ = self.sender.send(HealthCommand::Reset).await;
    }

    /// Re-arm the timer after [`stop`](Self::stop); the next check runs right away
    pub async fn resume(&self) {
        let _ = self.sender.send(HealthCommand::Start).await;
    }

    /// Cancel the timer; `check_now` and `status` keep working
    pub async fn stop(&self) {
        let _ = self.sender.send(HealthCommand::Stop).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(HealthCommand::Shutdown).await;
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
