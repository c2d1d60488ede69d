//! Connection pool behavior under load, idle reaping and shutdown

use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use vitalstack::actors::pool;
use vitalstack::metrics::labels;
use vitalstack::{MetricsCollector, Pool, PoolError};

use crate::helpers::*;

#[tokio::test]
async fn test_exhaustion_timeout_and_retry_after_release() {
    let manager = MockManager::new();
    let pool = Pool::initialize(manager.clone(), pool_options(2, 3))
        .await
        .unwrap();

    let a = pool.acquire().await.unwrap();
    let _b = pool.acquire().await.unwrap();
    let _c = pool.acquire().await.unwrap();
    assert_eq!(pool.active_connections().await, 3);

    let started = Instant::now();
    let result = pool.acquire_timeout(Duration::from_millis(100)).await;
    assert_matches!(result, Err(PoolError::Timeout(timeout)) if timeout == Duration::from_millis(100));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(pool.waiting_requests().await, 0);

    pool.release(a);
    let d = tokio::time::timeout(Duration::from_millis(50), pool.acquire())
        .await
        .expect("acquire should not block")
        .unwrap();
    assert!(*d < 3);
    assert_eq!(manager.backend.opened(), 3);
}

#[tokio::test]
async fn test_release_serves_longest_waiter_first() {
    let pool = Pool::initialize(MockManager::new(), pool_options(1, 1))
        .await
        .unwrap();
    let held = pool.acquire().await.unwrap();

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(5)).await })
    };
    while pool.waiting_requests().await < 1 {
        tokio::task::yield_now().await;
    }
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(5)).await })
    };
    while pool.waiting_requests().await < 2 {
        tokio::task::yield_now().await;
    }

    drop(held);
    let conn = first.await.unwrap().unwrap();
    assert_eq!(pool.waiting_requests().await, 1);
    assert!(!second.is_finished());

    drop(conn);
    assert!(second.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_idle_connections_are_reaped_down_to_min_size() {
    let manager = MockManager::new();
    let mut options = pool_options(1, 3);
    options.idle_timeout = Duration::from_secs(60);
    options.maintenance_interval = Duration::from_secs(30);
    let pool = Pool::initialize(manager.clone(), options).await.unwrap();

    let conns = vec![
        pool.acquire().await.unwrap(),
        pool.acquire().await.unwrap(),
        pool.acquire().await.unwrap(),
    ];
    drop(conns);
    assert_eq!(pool.size().await, 3);

    // passes at 30s and 60s see connections that are not idle long enough
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(pool.size().await, 3);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(pool.size().await, 1);
    assert_eq!(manager.backend.closed(), 2);

    // never below the minimum
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(pool.size().await, 1);
}

#[tokio::test]
async fn test_maintenance_replaces_broken_connections() {
    let manager = MockManager::new();
    let metrics = MetricsCollector::default();
    let pool = Pool::builder(manager.clone(), pool_options(2, 2))
        .metrics(metrics.clone())
        .build()
        .await
        .unwrap();

    manager.backend.break_connection(0);
    pool.maintain_now().await;

    let db = labels([("database", "test")]);
    for _ in 0..100 {
        if !metrics
            .get_metric_values(pool::RECONNECTED, &db)
            .unwrap()
            .is_empty()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(metrics.get_metric_values(pool::RECONNECTED, &db).unwrap().len(), 1);
    assert_eq!(manager.backend.opened(), 3);
    assert_eq!(pool.size().await, 2);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_use_connections() {
    let manager = MockManager::new();
    let mut options = pool_options(2, 2);
    options.shutdown_grace = Duration::from_secs(5);
    let pool = Pool::initialize(manager.clone(), options).await.unwrap();

    let conn = pool.acquire().await.unwrap();
    let shutdown = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.shutdown().await })
    };

    while !pool.status().await.shutting_down {
        tokio::task::yield_now().await;
    }
    assert_matches!(pool.acquire().await, Err(PoolError::ShuttingDown));
    assert!(!shutdown.is_finished());

    drop(conn);
    tokio::time::timeout(Duration::from_secs(1), shutdown)
        .await
        .expect("shutdown should complete once the connection is back")
        .unwrap();
    assert_eq!(manager.backend.closed(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_grace_period_elapses() {
    let manager = MockManager::new();
    let mut options = pool_options(1, 1);
    options.shutdown_grace = Duration::from_secs(30);
    let pool = Pool::initialize(manager.clone(), options).await.unwrap();

    let held = pool.acquire().await.unwrap();
    let started = Instant::now();
    pool.shutdown().await;

    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(pool.status().await.shutting_down);
    assert_eq!(manager.backend.closed(), 0);

    // returned after the deadline: closed instead of pooled
    drop(held);
    tokio::time::timeout(Duration::from_secs(1), async {
        while manager.backend.closed() < 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("late connection should be closed");
    assert_matches!(pool.acquire().await, Err(PoolError::ShuttingDown));
}
