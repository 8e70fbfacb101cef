
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use test_harness::{add_job, assert_eventually, TestScheduler};

/// SHUTDOWN is acknowledged with its own operation code.
#[tokio::test]
async fn test_shutdown_is_acknowledged() {
    let mut scheduler = TestScheduler::start().await;
    let mut client = scheduler.client().await;

    assert!(client.shutdown().await.unwrap());
    let ctx = scheduler.ctx.clone();
    assert_eventually(
        || {
            let ctx = ctx.clone();
            async move { !ctx.is_running() }
        },
        Duration::from_secs(2),
        "Running flag should clear",
    )
    .await;
    assert!(
        scheduler.wait_stopped(Duration::from_secs(2)).await,
        "Server should stop after SHUTDOWN"
    );
}

/// A worker blocked in QUERY_WORK is released without a reply.
#[tokio::test]
async fn test_shutdown_releases_blocked_worker() {
    let mut scheduler = TestScheduler::start().await;
    let mut worker = scheduler.client().await;

    let blocked = tokio::spawn(async move { worker.query_work().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    let mut admin = scheduler.client().await;
    assert!(admin.shutdown().await.unwrap());

    let outcome = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("blocked worker should return after shutdown")
        .unwrap()
        .unwrap();
    assert!(outcome.is_none());

    assert!(scheduler.wait_stopped(Duration::from_secs(2)).await);
}

/// Idle connections are closed once the running flag clears.
#[tokio::test]
async fn test_shutdown_closes_idle_connections() {
    let mut scheduler = TestScheduler::start().await;
    let mut idle = TcpStream::connect(scheduler.addr).await.unwrap();
    let mut client = scheduler.client().await;
    client.submit_job(&add_job(1, vec![1, 2])).await.unwrap();

    scheduler.shutdown().await;

    let mut buf = [0u8; 4];
    let n = tokio::time::timeout(Duration::from_secs(2), idle.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

/// New connections are refused after shutdown completes.
#[tokio::test]
async fn test_listener_closed_after_shutdown() {
    let mut scheduler = TestScheduler::start().await;
    let addr = scheduler.addr;
    scheduler.shutdown().await;

    assert_eventually(
        || async move { TcpStream::connect(addr).await.is_err() },
        Duration::from_secs(2),
        "Listener should be closed",
    )
    .await;
}

/// Cancelling the shared token has the same effect as a SHUTDOWN request.
#[tokio::test]
async fn test_token_cancellation_stops_server() {
    let mut scheduler = TestScheduler::start().await;
    let mut worker = scheduler.client().await;
    let blocked = tokio::spawn(async move { worker.query_work().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    scheduler.shutdown.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(outcome.is_none());
    assert!(scheduler.wait_stopped(Duration::from_secs(2)).await);
}
