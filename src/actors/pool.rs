//! PoolActor - Owns a bounded set of reusable connections
//!
//! One task owns every slot and the wait queue and handles one message at a
//! time, so "idle connection? → room to grow? → queue up" can never race with
//! itself. Anything slow (opening, probing, closing) runs in a spawned task
//! that reports back with a message.
//!
//! ## Acquire
//!
//! ```text
//! Acquire ──▶ idle slot? ──yes──▶ hand out (most recently used first)
//!                │
//!                no
//!                ▼
//!          queue waiter ──▶ total < max_size? ──yes──▶ spawn open ──▶ Opened ──▶ oldest waiter
//!                                  │
//!                                  no ──▶ wait for Release or deadline
//! ```
//!
//! A released connection always goes to the longest-waiting caller first.
//! Satisfying a waiter removes it from the queue, so its deadline can no
//! longer fire.
//!
//! ## Maintenance (every `maintenance_interval`)
//!
//! 1. close idle connections past `idle_timeout`, oldest first, never going below `min_size`
//! 2. probe every remaining idle connection; a broken one is closed and replaced
//! 3. open connections until `min_size` is reached again
//!
//! A failed replacement drops the slot. The pool runs one connection short
//! until the next pass tops it up, and a `SystemError` event is published.

use std::collections::VecDeque;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::connection::ConnectionManager;
use crate::error::{MetricsError, PoolError};
use crate::events::{EventBus, EventMeta, EventPayload, EventSource, Priority};
use crate::metrics::{Labels, MetricDefinition, MetricsCollector, labels};

use super::health::{ProbePolicy, execute_with_retry};
use super::messages::{OpenTicket, PoolCommand, PoolStatus, ProbeOutcome};

pub const ACQUIRED: &str = "pool.connections.acquired";
pub const CREATED: &str = "pool.connections.created";
pub const QUEUED: &str = "pool.connections.queued";
pub const TIMEOUT: &str = "pool.connections.timeout";
pub const RELEASED: &str = "pool.connections.released";
pub const CLOSED: &str = "pool.connections.closed";
pub const RECONNECTED: &str = "pool.connections.reconnected";
pub const RECONNECT_FAILED: &str = "pool.connections.reconnect_failed";

pub const ACTIVE: &str = "pool.connections.active";
pub const IDLE: &str = "pool.connections.idle";
pub const WAITING: &str = "pool.connections.waiting";

const COUNTERS: [&str; 8] = [
    ACQUIRED,
    CREATED,
    QUEUED,
    TIMEOUT,
    RELEASED,
    CLOSED,
    RECONNECTED,
    RECONNECT_FAILED,
];

const GAUGES: [&str; 3] = [ACTIVE, IDLE, WAITING];

/// Runtime options of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub maintenance_interval: Duration,
    /// How long `shutdown` waits for in-use connections
    pub shutdown_grace: Duration,
    /// Liveness probe settings for idle connections
    pub probe: ProbePolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            probe: ProbePolicy::default(),
        }
    }
}

type CommandSender<C> = mpsc::UnboundedSender<PoolCommand<C>>;

/// A connection checked out of the pool
///
/// Dereferences to the connection and goes back to the pool when dropped.
pub struct PooledConnection<C> {
    id: u64,
    conn: Option<C>,
    pool: CommandSender<C>,
}

impl<C> PooledConnection<C> {
    fn new(id: u64, conn: C, pool: CommandSender<C>) -> Self {
        Self {
            id,
            conn: Some(conn),
            pool,
        }
    }

    /// Pool-internal slot id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take the connection out without returning it
    fn into_inner(mut self) -> Option<C> {
        self.conn.take()
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is present until the guard is dropped"),
        }
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is present until the guard is dropped"),
        }
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let release = PoolCommand::Release { id: self.id, conn };
            if self.pool.send(release).is_err() {
                trace!("pool is gone, dropping connection {}", self.id);
            }
        }
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("conn", &self.conn)
            .finish()
    }
}

enum SlotState<C> {
    Idle(C),
    InUse,
    Probing,
}

struct Slot<C> {
    id: u64,
    state: SlotState<C>,
    last_used: Instant,
}

struct Waiter<C> {
    id: u64,
    deadline: Instant,
    timeout: Duration,
    respond_to: oneshot::Sender<Result<PooledConnection<C>, PoolError>>,
}

struct ShutdownState<C> {
    deadline: Instant,
    respond_to: Vec<oneshot::Sender<()>>,
    closing: Vec<C>,
}

/// Actor that owns the pool state
struct PoolActor<M: ConnectionManager> {
    manager: Arc<M>,
    options: PoolOptions,
    slots: Vec<Slot<M::Connection>>,
    waiters: VecDeque<Waiter<M::Connection>>,
    /// Opens in flight
    pending: usize,
    next_id: u64,
    command_rx: mpsc::UnboundedReceiver<PoolCommand<M::Connection>>,
    /// Weak so that the actor stops once every handle and guard is gone
    command_tx: mpsc::WeakUnboundedSender<PoolCommand<M::Connection>>,
    metrics: Option<MetricsCollector>,
    events: Option<EventBus>,
    labels: Labels,
    shutdown: Option<ShutdownState<M::Connection>>,
}

impl<M: ConnectionManager> PoolActor<M> {
    #[instrument(skip(self), fields(database = %self.manager.database()))]
    async fn run(mut self) {
        debug!("starting pool actor");

        let period = self.options.maintenance_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_deadline = self.waiters.iter().map(|w| w.deadline).min();
            let shutdown_deadline = self.shutdown.as_ref().map(|s| s.deadline);

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd),
                        None => {
                            debug!("all pool handles dropped");
                            break;
                        }
                    }
                }

                _ = ticker.tick(), if self.shutdown.is_none() => {
                    self.maintain();
                }

                _ = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    self.expire_waiters();
                }

                _ = sleep_until(shutdown_deadline.unwrap_or_else(Instant::now)), if shutdown_deadline.is_some() => {
                    warn!(
                        "shutdown grace period elapsed with {} connections still in use",
                        self.slots.len()
                    );
                    break;
                }
            }

            if self.shutdown_complete() {
                break;
            }
        }

        self.finish().await;
        self.drain().await;
        debug!("pool actor stopped");
    }

    fn handle(&mut self, cmd: PoolCommand<M::Connection>) {
        match cmd {
            PoolCommand::Acquire {
                timeout,
                respond_to,
            } => self.acquire(timeout, respond_to),

            PoolCommand::Release { id, conn } => self.release(id, conn),

            PoolCommand::Opened { ticket, result } => self.opened(ticket, result),

            PoolCommand::Probed { id, outcome } => self.probed(id, outcome),

            PoolCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }

            PoolCommand::MaintainNow { respond_to } => {
                if self.shutdown.is_none() {
                    self.maintain();
                }
                let _ = respond_to.send(());
            }

            PoolCommand::Shutdown { respond_to } => self.begin_shutdown(respond_to),
        }
    }

    fn total(&self) -> usize {
        self.slots.len() + self.pending
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn slot_mut(&mut self, id: u64) -> Option<&mut Slot<M::Connection>> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }

    fn remove_slot(&mut self, id: u64) {
        self.slots.retain(|slot| slot.id != id);
    }

    fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            total: self.slots.len(),
            waiting: self.waiters.len(),
            pending: self.pending,
            shutting_down: self.shutdown.is_some(),
            ..PoolStatus::default()
        };
        for slot in &self.slots {
            match slot.state {
                SlotState::Idle(_) => status.idle += 1,
                SlotState::InUse => status.active += 1,
                SlotState::Probing => {}
            }
        }
        status
    }

    fn acquire(
        &mut self,
        timeout: Option<Duration>,
        respond_to: oneshot::Sender<Result<PooledConnection<M::Connection>, PoolError>>,
    ) {
        if self.shutdown.is_some() {
            let _ = respond_to.send(Err(PoolError::ShuttingDown));
            return;
        }

        // most recently used idle connection first, so surplus ones age out
        let idle = self
            .slots
            .iter_mut()
            .filter(|slot| matches!(slot.state, SlotState::Idle(_)))
            .max_by_key(|slot| slot.last_used);

        if let Some(slot) = idle {
            let id = slot.id;
            if let SlotState::Idle(conn) = mem::replace(&mut slot.state, SlotState::InUse) {
                if let Some(conn) = self.hand_over(id, conn, respond_to) {
                    self.dispatch(id, conn);
                }
            }
            return;
        }

        let timeout = timeout.unwrap_or(self.options.acquire_timeout);
        let waiter_id = self.next_id();
        self.waiters.push_back(Waiter {
            id: waiter_id,
            deadline: Instant::now() + timeout,
            timeout,
            respond_to,
        });

        if self.total() < self.options.max_size {
            self.open(OpenTicket::ForWaiter(waiter_id));
        } else {
            trace!("pool exhausted, {} callers waiting", self.waiters.len());
            self.count(QUEUED, 1);
        }
    }

    /// Send a guard to one caller. Gives the connection back if the caller is gone.
    fn hand_over(
        &mut self,
        id: u64,
        conn: M::Connection,
        respond_to: oneshot::Sender<Result<PooledConnection<M::Connection>, PoolError>>,
    ) -> Option<M::Connection> {
        let Some(pool) = self.command_tx.upgrade() else {
            return Some(conn);
        };

        match respond_to.send(Ok(PooledConnection::new(id, conn, pool))) {
            Ok(()) => {
                self.count(ACQUIRED, 1);
                None
            }
            Err(rejected) => rejected.ok().and_then(PooledConnection::into_inner),
        }
    }

    /// Give a free connection to the oldest live waiter, or park it as idle
    fn dispatch(&mut self, id: u64, mut conn: M::Connection) {
        while let Some(waiter) = self.waiters.pop_front() {
            match self.hand_over(id, conn, waiter.respond_to) {
                None => {
                    if let Some(slot) = self.slot_mut(id) {
                        slot.state = SlotState::InUse;
                    }
                    return;
                }
                Some(returned) => conn = returned,
            }
        }

        match self.slot_mut(id) {
            Some(slot) => slot.state = SlotState::Idle(conn),
            None => {
                warn!("connection {id} has no slot, closing it");
                self.spawn_close(vec![conn]);
            }
        }
    }

    fn release(&mut self, id: u64, conn: M::Connection) {
        self.count(RELEASED, 1);

        if let Some(shutdown) = &mut self.shutdown {
            shutdown.closing.push(conn);
            self.remove_slot(id);
            return;
        }

        match self.slot_mut(id) {
            Some(slot) => {
                slot.last_used = Instant::now();
                self.dispatch(id, conn);
            }
            None => {
                warn!("released connection {id} is not part of the pool, closing it");
                self.spawn_close(vec![conn]);
            }
        }
    }

    fn opened(&mut self, ticket: OpenTicket, result: anyhow::Result<M::Connection>) {
        self.pending = self.pending.saturating_sub(1);

        match result {
            Ok(conn) => {
                if let Some(shutdown) = &mut self.shutdown {
                    shutdown.closing.push(conn);
                    return;
                }

                self.count(CREATED, 1);
                let id = self.next_id();
                self.slots.push(Slot {
                    id,
                    state: SlotState::InUse,
                    last_used: Instant::now(),
                });
                self.dispatch(id, conn);
            }
            Err(err) => match ticket {
                OpenTicket::ForWaiter(waiter_id) => {
                    warn!("failed to open connection: {err:#}");
                    let position = self.waiters.iter().position(|w| w.id == waiter_id);
                    if let Some(waiter) = position.and_then(|pos| self.waiters.remove(pos)) {
                        let _ = waiter.respond_to.send(Err(PoolError::Connect(err)));
                    }
                }
                OpenTicket::Replenish => {
                    self.report_error("failed to open connection", format!("{err:#}"));
                }
            },
        }
    }

    fn probed(&mut self, id: u64, outcome: ProbeOutcome<M::Connection>) {
        let (conn, fresh) = match outcome {
            ProbeOutcome::Healthy(conn) => (conn, false),
            ProbeOutcome::Replaced(conn) => {
                self.count(RECONNECTED, 1);
                self.count(CLOSED, 1);
                (conn, true)
            }
            ProbeOutcome::Failed {
                probe_error,
                connect_error,
            } => {
                self.remove_slot(id);
                self.count(CLOSED, 1);
                self.count(RECONNECT_FAILED, 1);
                self.report_error(
                    &format!("failed to reconnect: {connect_error}"),
                    format!("connection {id} failed its liveness probe: {probe_error}"),
                );
                self.grow_for_waiters();
                return;
            }
        };

        if let Some(shutdown) = &mut self.shutdown {
            shutdown.closing.push(conn);
            self.remove_slot(id);
            return;
        }

        if fresh && let Some(slot) = self.slot_mut(id) {
            slot.last_used = Instant::now();
        }
        self.dispatch(id, conn);
    }

    /// Open connections for queued callers that no open is on its way for
    fn grow_for_waiters(&mut self) {
        let uncovered = self.waiters.len().saturating_sub(self.pending);
        let room = self.options.max_size.saturating_sub(self.total());
        for _ in 0..uncovered.min(room) {
            self.open(OpenTicket::Replenish);
        }
    }

    fn expire_waiters(&mut self) {
        let now = Instant::now();
        let mut kept = VecDeque::with_capacity(self.waiters.len());

        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.deadline <= now {
                debug!("acquire timed out after {:?}", waiter.timeout);
                self.count(TIMEOUT, 1);
                let _ = waiter.respond_to.send(Err(PoolError::Timeout(waiter.timeout)));
            } else {
                kept.push_back(waiter);
            }
        }

        self.waiters = kept;
    }

    fn maintain(&mut self) {
        let now = Instant::now();

        let mut idle: Vec<(u64, Instant)> = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Idle(_)))
            .map(|slot| (slot.id, slot.last_used))
            .collect();
        idle.sort_by_key(|(_, last_used)| *last_used);

        let mut reaped = Vec::new();
        for (id, last_used) in idle {
            if self.total() <= self.options.min_size {
                break;
            }
            if now.duration_since(last_used) <= self.options.idle_timeout {
                continue;
            }
            if let Some(pos) = self.slots.iter().position(|slot| slot.id == id) {
                let slot = self.slots.swap_remove(pos);
                if let SlotState::Idle(conn) = slot.state {
                    reaped.push(conn);
                }
            }
        }

        if !reaped.is_empty() {
            debug!(reaped = reaped.len(), "closing idle connections");
            self.count(CLOSED, reaped.len());
            self.spawn_close(reaped);
        }

        let mut to_probe = Vec::new();
        for slot in &mut self.slots {
            if matches!(slot.state, SlotState::Idle(_))
                && let SlotState::Idle(conn) = mem::replace(&mut slot.state, SlotState::Probing)
            {
                to_probe.push((slot.id, conn));
            }
        }
        trace!("probing {} idle connections", to_probe.len());
        for (id, conn) in to_probe {
            self.spawn_probe(id, conn);
        }

        let missing = self.options.min_size.saturating_sub(self.total());
        if missing > 0 {
            debug!("replenishing {missing} connections");
            for _ in 0..missing {
                self.open(OpenTicket::Replenish);
            }
        }

        self.record_gauges();
    }

    fn open(&mut self, ticket: OpenTicket) {
        let Some(sender) = self.command_tx.upgrade() else {
            return;
        };

        self.pending += 1;
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            let result = manager.connect().await;
            let _ = sender.send(PoolCommand::Opened { ticket, result });
        });
    }

    fn spawn_probe(&mut self, id: u64, conn: M::Connection) {
        let Some(sender) = self.command_tx.upgrade() else {
            if let Some(slot) = self.slot_mut(id) {
                slot.state = SlotState::Idle(conn);
            }
            return;
        };

        let manager = Arc::clone(&self.manager);
        let policy = self.options.probe;
        tokio::spawn(async move {
            let probe = execute_with_retry(&policy, || manager.is_valid(&conn)).await;

            let outcome = match probe {
                Ok(_) => ProbeOutcome::Healthy(conn),
                Err(probe_error) => {
                    debug!("connection {id} failed its liveness probe: {probe_error}");
                    manager.close(conn).await;
                    match manager.connect().await {
                        Ok(fresh) => ProbeOutcome::Replaced(fresh),
                        Err(err) => ProbeOutcome::Failed {
                            probe_error: probe_error.to_string(),
                            connect_error: format!("{err:#}"),
                        },
                    }
                }
            };

            let _ = sender.send(PoolCommand::Probed { id, outcome });
        });
    }

    fn spawn_close(&self, conns: Vec<M::Connection>) {
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            join_all(conns.into_iter().map(|conn| manager.close(conn))).await;
        });
    }

    fn begin_shutdown(&mut self, respond_to: oneshot::Sender<()>) {
        if let Some(shutdown) = &mut self.shutdown {
            shutdown.respond_to.push(respond_to);
            return;
        }

        info!("shutting down connection pool");

        for waiter in self.waiters.drain(..) {
            let _ = waiter.respond_to.send(Err(PoolError::ShuttingDown));
        }

        let mut closing = Vec::new();
        for slot in mem::take(&mut self.slots) {
            let Slot {
                id,
                state,
                last_used,
            } = slot;
            match state {
                SlotState::Idle(conn) => closing.push(conn),
                state => self.slots.push(Slot {
                    id,
                    state,
                    last_used,
                }),
            }
        }

        self.shutdown = Some(ShutdownState {
            deadline: Instant::now() + self.options.shutdown_grace,
            respond_to: vec![respond_to],
            closing,
        });
    }

    fn shutdown_complete(&self) -> bool {
        self.shutdown.is_some() && self.slots.is_empty() && self.pending == 0
    }

    async fn finish(&mut self) {
        let (mut closing, responders) = match self.shutdown.take() {
            Some(shutdown) => (shutdown.closing, shutdown.respond_to),
            None => (Vec::new(), Vec::new()),
        };

        for slot in mem::take(&mut self.slots) {
            match slot.state {
                SlotState::Idle(conn) => closing.push(conn),
                _ => warn!(
                    "connection {} is still in use, closing it once returned",
                    slot.id
                ),
            }
        }

        for waiter in self.waiters.drain(..) {
            let _ = waiter.respond_to.send(Err(PoolError::ShuttingDown));
        }

        debug!("closing {} connections", closing.len());
        self.count(CLOSED, closing.len());
        let manager = Arc::clone(&self.manager);
        join_all(closing.into_iter().map(|conn| manager.close(conn))).await;

        for respond_to in responders {
            let _ = respond_to.send(());
        }
    }

    /// Close connections that come back after the pool finished, until every
    /// handle and guard is gone
    async fn drain(&mut self) {
        while let Some(cmd) = self.command_rx.recv().await {
            let conn = match cmd {
                PoolCommand::Release { id, conn } => {
                    debug!("closing connection {id} returned after shutdown");
                    self.count(RELEASED, 1);
                    conn
                }
                PoolCommand::Opened {
                    result: Ok(conn), ..
                } => conn,
                PoolCommand::Probed {
                    outcome: ProbeOutcome::Healthy(conn) | ProbeOutcome::Replaced(conn),
                    ..
                } => conn,
                PoolCommand::Opened { .. } | PoolCommand::Probed { .. } => continue,
                PoolCommand::Acquire { respond_to, .. } => {
                    let _ = respond_to.send(Err(PoolError::ShuttingDown));
                    continue;
                }
                PoolCommand::GetStatus { respond_to } => {
                    let _ = respond_to.send(PoolStatus {
                        shutting_down: true,
                        ..PoolStatus::default()
                    });
                    continue;
                }
                PoolCommand::MaintainNow { respond_to } | PoolCommand::Shutdown { respond_to } => {
                    let _ = respond_to.send(());
                    continue;
                }
            };

            self.count(CLOSED, 1);
            self.manager.close(conn).await;
        }
    }

    fn count(&self, name: &str, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(metrics) = &self.metrics
            && let Err(err) = metrics.increment(name, n as f64, &self.labels)
        {
            trace!("failed to record {name}: {err}");
        }
    }

    fn record_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };

        let status = self.status();
        for (name, value) in [
            (ACTIVE, status.active),
            (IDLE, status.idle),
            (WAITING, status.waiting),
        ] {
            if let Err(err) = metrics.gauge(name, value as f64, &self.labels) {
                trace!("failed to record {name}: {err}");
            }
        }
    }

    fn report_error(&self, error_message: &str, details: String) {
        error!("{error_message}: {details}");

        if let Some(events) = &self.events {
            events.publish(
                EventPayload::SystemError {
                    service: "connection-pool".to_string(),
                    error: error_message.to_string(),
                    details,
                },
                EventMeta::new(EventSource::Service, Priority::High),
            );
        }
    }
}

/// Register the pool's counters and gauges; already registered ones are kept
fn register_pool_metrics(metrics: &MetricsCollector) -> Result<(), MetricsError> {
    let definitions = COUNTERS
        .iter()
        .map(|name| MetricDefinition::counter(*name))
        .chain(GAUGES.iter().map(|name| MetricDefinition::gauge(*name)));

    for definition in definitions {
        match metrics.register_metric(definition.with_labels(["database"])) {
            Ok(()) | Err(MetricsError::AlreadyRegistered(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Collaborators of a pool, set before warm-up
pub struct PoolBuilder<M: ConnectionManager> {
    manager: M,
    options: PoolOptions,
    metrics: Option<MetricsCollector>,
    events: Option<EventBus>,
}

impl<M: ConnectionManager> PoolBuilder<M> {
    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Open `min_size` connections and start the actor
    ///
    /// Any failure during warm-up closes what was opened and is returned.
    pub async fn build(self) -> Result<Pool<M>, PoolError> {
        let Self {
            manager,
            options,
            metrics,
            events,
        } = self;

        if options.max_size == 0 || options.min_size > options.max_size {
            return Err(PoolError::InvalidOptions(format!(
                "min_size {} / max_size {}",
                options.min_size, options.max_size
            )));
        }

        let manager = Arc::new(manager);
        let labels = labels([("database", manager.database())]);

        if let Some(metrics) = &metrics
            && let Err(err) = register_pool_metrics(metrics)
        {
            warn!("pool metrics unavailable: {err}");
        }

        let mut opened = Vec::with_capacity(options.min_size);
        for _ in 0..options.min_size {
            match manager.connect().await {
                Ok(conn) => opened.push(conn),
                Err(err) => {
                    error!("failed to open initial connections: {err:#}");
                    join_all(opened.into_iter().map(|conn| manager.close(conn))).await;
                    return Err(PoolError::Connect(err));
                }
            }
        }

        info!(
            database = manager.database(),
            "connection pool ready with {} connections",
            opened.len()
        );

        let now = Instant::now();
        let slots: Vec<_> = opened
            .into_iter()
            .enumerate()
            .map(|(index, conn)| Slot {
                id: index as u64 + 1,
                state: SlotState::Idle(conn),
                last_used: now,
            })
            .collect();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = PoolActor {
            manager,
            next_id: slots.len() as u64,
            slots,
            options: options.clone(),
            waiters: VecDeque::new(),
            pending: 0,
            command_rx: cmd_rx,
            command_tx: cmd_tx.downgrade(),
            metrics,
            events,
            labels,
            shutdown: None,
        };
        actor.count(CREATED, actor.slots.len());
        tokio::spawn(actor.run());

        Ok(Pool {
            sender: cmd_tx,
            options,
        })
    }
}

/// Handle for the pool actor
pub struct Pool<M: ConnectionManager> {
    sender: CommandSender<M::Connection>,
    options: PoolOptions,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            options: self.options.clone(),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> Pool<M> {
    pub fn builder(manager: M, options: PoolOptions) -> PoolBuilder<M> {
        PoolBuilder {
            manager,
            options,
            metrics: None,
            events: None,
        }
    }

    /// Warm up a pool without metrics or events
    pub async fn initialize(manager: M, options: PoolOptions) -> Result<Self, PoolError> {
        Self::builder(manager, options).build().await
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Acquire with the pool's default timeout
    pub async fn acquire(&self) -> Result<PooledConnection<M::Connection>, PoolError> {
        self.request(None).await
    }

    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<M::Connection>, PoolError> {
        self.request(Some(timeout)).await
    }

    async fn request(
        &self,
        timeout: Option<Duration>,
    ) -> Result<PooledConnection<M::Connection>, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PoolCommand::Acquire {
                timeout,
                respond_to: tx,
            })
            .map_err(|_| PoolError::ShuttingDown)?;

        rx.await.map_err(|_| PoolError::ShuttingDown)?
    }

    /// Return a connection; same as dropping the guard
    pub fn release(&self, conn: PooledConnection<M::Connection>) {
        drop(conn);
    }

    /// Current snapshot; reports an empty, shut down pool once the actor stopped
    pub async fn status(&self) -> PoolStatus {
        let stopped = PoolStatus {
            shutting_down: true,
            ..PoolStatus::default()
        };

        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PoolCommand::GetStatus { respond_to: tx })
            .is_err()
        {
            return stopped;
        }
        rx.await.unwrap_or(stopped)
    }

    pub async fn active_connections(&self) -> usize {
        self.status().await.active
    }

    pub async fn waiting_requests(&self) -> usize {
        self.status().await.waiting
    }

    pub async fn size(&self) -> usize {
        self.status().await.total
    }

    /// Run a maintenance pass now
    pub async fn maintain_now(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PoolCommand::MaintainNow { respond_to: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Reject waiters, wait for in-use connections up to the grace period, close everything
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PoolCommand::Shutdown { respond_to: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}
