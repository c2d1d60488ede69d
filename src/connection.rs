//! Connection factories for the pool
//!
//! The pool never opens sockets itself. It asks a [`ConnectionManager`] to
//! open, probe and close connections, so tests can plug in an in-memory
//! manager and the hub uses [`TcpManager`].

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Opens, probes and closes connections of one kind
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    /// Open a fresh connection
    async fn connect(&self) -> anyhow::Result<Self::Connection>;

    /// Liveness probe. An error marks the connection as broken.
    async fn is_valid(&self, conn: &Self::Connection) -> anyhow::Result<()>;

    /// Close a connection that leaves the pool
    async fn close(&self, conn: Self::Connection);

    /// Database name used as the `database` label on pool metrics
    fn database(&self) -> &str {
        "default"
    }
}

/// An open TCP connection to the backing store
#[derive(Debug)]
pub struct TcpConnection {
    pub stream: TcpStream,
    pub database: String,
}

/// Plain TCP connection manager
#[derive(Debug, Clone)]
pub struct TcpManager {
    endpoint: String,
    database: String,
    connect_timeout: Duration,
}

impl TcpManager {
    pub fn new(endpoint: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            database: database.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ConnectionManager for TcpManager {
    type Connection = TcpConnection;

    async fn connect(&self) -> anyhow::Result<TcpConnection> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.endpoint))
            .await
            .with_context(|| format!("connecting to {} timed out", self.endpoint))?
            .with_context(|| format!("failed to connect to {}", self.endpoint))?;

        stream.set_nodelay(true)?;
        debug!("opened connection to {} ({})", self.endpoint, self.database);

        Ok(TcpConnection {
            stream,
            database: self.database.clone(),
        })
    }

    async fn is_valid(&self, conn: &TcpConnection) -> anyhow::Result<()> {
        if let Some(err) = conn.stream.take_error()? {
            return Err(err).context("socket reported an error");
        }

        // a readable socket with zero bytes means the peer closed it
        let mut buf = [0u8; 1];
        match conn.stream.peek(&mut buf).now_or_never() {
            Some(Ok(0)) => bail!("connection closed by {}", self.endpoint),
            Some(Err(err)) => Err(err).context("failed to probe connection"),
            Some(Ok(_)) | None => Ok(()),
        }
    }

    async fn close(&self, mut conn: TcpConnection) {
        if let Err(err) = conn.stream.shutdown().await {
            trace!("error while closing connection to {}: {err}", self.endpoint);
        }
    }

    fn database(&self) -> &str {
        &self.database
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_manager_connects_and_probes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let manager = TcpManager::new(addr.to_string(), "health");
        let conn = manager.connect().await.unwrap();
        let (_server_side, _) = accept.await.unwrap();

        assert_eq!(conn.database, "health");
        assert!(manager.is_valid(&conn).await.is_ok());
        manager.close(conn).await;
    }

    #[tokio::test]
    async fn test_tcp_manager_detects_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let manager = TcpManager::new(addr.to_string(), "health");
        let conn = manager.connect().await.unwrap();
        let (server_side, _) = accept.await.unwrap();
        drop(server_side);

        // wait for the FIN to arrive
        conn.stream.readable().await.unwrap();
        assert!(manager.is_valid(&conn).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_manager_connect_failure() {
        // bind and drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = TcpManager::new(addr.to_string(), "health")
            .with_connect_timeout(Duration::from_millis(500));
        assert!(manager.connect().await.is_err());
    }
}
