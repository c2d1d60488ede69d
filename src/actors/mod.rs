//! Actor-based runtime components
//!
//! Each stateful component runs as an independent async task that owns its
//! state and is driven through Tokio channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!   callers ──acquire/release──▶ ┌────────────┐ ──probe/close──▶ backend
//!                                │ PoolActor  │
//!                                └─────┬──────┘
//!                                      │ counters, gauges
//!   HealthCheckActor ──timings──▶ ┌────▼─────────────┐
//!                                 │ MetricsCollector │ (shared, lock based)
//!                                 └────┬─────────────┘
//!                                      │ metric_collected
//!                                 ┌────▼─────┐
//!                                 │ EventBus │ (broadcast)
//!                                 └────┬─────┘
//!                                      │ subscribe
//!                                 ┌────▼───────┐ ──notify──▶ channels
//!                                 │ AlertActor │
//!                                 └────────────┘
//! ```
//!
//! ## Actor Types
//!
//! - **PoolActor**: Owns connection slots and the FIFO wait queue
//! - **HealthCheckActor**: Runs one probe on an interval and keeps statistics
//! - **AlertActor**: Evaluates rules against metrics and dispatches notifications
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Events**: Alerts, metric samples and errors fan out over the event bus
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod alert;
pub mod health;
pub mod messages;
pub mod pool;
