pub mod actors;
pub mod alerts;
pub mod config;
pub mod connection;
pub mod discord;
pub mod error;
pub mod events;
pub mod metrics;
pub mod notify;
pub mod util;

pub use actors::alert::{AlertHandle, AlertOptions};
pub use actors::health::{HealthCheckHandle, HealthCheckOptions, ProbePolicy, execute_with_retry};
pub use actors::messages::{HealthEvent, HealthStatus, PoolStatus};
pub use actors::pool::{Pool, PoolBuilder, PoolOptions, PooledConnection};
pub use connection::{ConnectionManager, TcpConnection, TcpManager};
pub use error::{AlertError, HealthError, MetricsError, PoolError};
pub use events::{Event, EventBus, EventFilter, EventMeta, EventPayload, EventSource, Priority, Topic};
pub use metrics::{Labels, MetricDefinition, MetricKind, MetricsCollector, MetricsOptions};
pub use notify::{Notifier, NotifierRegistry};
