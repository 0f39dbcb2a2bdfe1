use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use storage_server::{
    client::Client,
    config::{FramingConfig, ServerMode, Settings},
    host::{LogNotifier, SystemClock},
    message::{Request, Response},
    server::{Server, ServerHandle, spawn_server},
    store::Store,
    transport::{recv_message, send_message},
};
use tempfile::TempDir;
use tokio::time::timeout;

fn settings(dir: &TempDir, idle_timeout_secs: u64) -> Settings {
    Settings {
        idle_timeout_secs,
        temp_dir: dir.path().to_path_buf(),
        tcp: !cfg!(unix),
        port: 0,
        ..Settings::default()
    }
}

async fn start(settings: &Settings, mode: ServerMode) -> Result<ServerHandle> {
    let server = Server::bind(settings, mode, Arc::new(SystemClock), &LogNotifier).await?;
    Ok(spawn_server(server)?)
}

fn client(handle: &ServerHandle, table: &str) -> Client {
    Client::new(handle.endpoint().clone(), table)
}

#[tokio::test]
async fn set_get_and_overwrite_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start(&settings(&dir, 60), ServerMode::Daemon).await?;
    let movies = client(&handle, "movies");

    movies.set("title", "Brazil").await;
    assert_eq!(movies.get("title").await, "Brazil");
    movies.set("title", "Alphaville").await;
    assert_eq!(movies.get("title").await, "Alphaville");
    assert_eq!(movies.get("never-set").await, "");

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn get_multi_is_aligned_with_items() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start(&settings(&dir, 60), ServerMode::Daemon).await?;
    let pages = client(&handle, "pages");

    let data = BTreeMap::from([
        ("1".to_string(), "first".to_string()),
        ("3".to_string(), "third".to_string()),
    ]);
    pages.set_multi("page", &data).await;

    let items: Vec<String> = ["1", "2", "3", "4"].iter().map(|s| s.to_string()).collect();
    assert_eq!(
        pages.get_multi("page", &items).await,
        vec!["first", "", "third", ""]
    );

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn delete_removes_matching_entries() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start(&settings(&dir, 60), ServerMode::Daemon).await?;
    let table = client(&handle, "t");

    table.set("cacheone", "1").await;
    table.set("cachetwo", "2").await;
    table.set("keep", "3").await;
    table.delete("cache%").await;

    assert_eq!(table.get("cacheone").await, "");
    assert_eq!(table.get("cachetwo").await, "");
    assert_eq!(table.get("keep").await, "3");

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn lock_is_exclusive_across_clients() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start(&settings(&dir, 60), ServerMode::Daemon).await?;
    let first = client(&handle, "jobs");
    let second = client(&handle, "jobs");

    assert!(first.lock("refresh").await);
    assert!(!second.lock("refresh").await);
    assert!(first.unlock("refresh").await);
    assert!(second.lock("refresh").await);

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn lock_left_by_previous_server_is_reclaimed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings(&dir, 60);
    {
        let mut store = Store::open(&settings.database_path())?;
        store.set("jobs", "refresh", "1000.5")?;
    }

    let handle = start(&settings, ServerMode::Daemon).await?;
    let jobs = client(&handle, "jobs");
    assert!(jobs.lock("refresh").await);
    assert!(!jobs.lock("refresh").await);

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn values_larger_than_one_chunk_survive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start(&settings(&dir, 60), ServerMode::Daemon).await?;
    let blobs = client(&handle, "blobs");

    let big: String = (0..10_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    blobs.set("big", &big).await;
    assert_eq!(blobs.get("big").await, big);

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn corrupt_database_file_is_replaced() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings(&dir, 60);
    std::fs::write(settings.database_path(), b"garbage header bytes ".repeat(100))?;

    let handle = start(&settings, ServerMode::Daemon).await?;
    let table = client(&handle, "t");
    table.set("key", "value").await;
    assert_eq!(table.get("key").await, "value");

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn malformed_request_gets_no_reply_and_server_keeps_going() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start(&settings(&dir, 60), ServerMode::Daemon).await?;
    let framing = FramingConfig::default();

    let mut stream = handle.endpoint().connect().await?;
    send_message(&mut stream, b"{'action': 'get', 'table': 't'}", &framing).await?;
    assert!(recv_message(&mut stream, &framing).await.is_err());

    let mut stream = handle.endpoint().connect().await?;
    let lock = Request::Lock {
        table: "t".into(),
        name: "n".into(),
    };
    send_message(&mut stream, &lock.encode()?, &framing).await?;
    let reply = recv_message(&mut stream, &framing).await?;
    assert_eq!(Response::decode(&reply)?, Response::flag(true));

    let report = handle.shutdown().await?;
    assert_eq!(report.requests_served, 2);
    Ok(())
}

#[tokio::test]
async fn idle_instance_exits_shortly_after_threshold() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings(&dir, 3);
    let started = Instant::now();
    let handle = start(&settings, ServerMode::Instance).await?;

    let report = timeout(Duration::from_secs(6), handle.join()).await??;
    let elapsed = started.elapsed();

    assert_eq!(report.requests_served, 0);
    assert!(elapsed >= Duration::from_secs(3), "exited too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "exited too late: {elapsed:?}");
    if cfg!(unix) {
        assert!(!settings.socket_path().exists());
    }
    Ok(())
}

#[tokio::test]
async fn activity_postpones_idle_shutdown() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let handle = start(&settings(&dir, 1), ServerMode::Instance).await?;
    let table = client(&handle, "t");

    for round in 0..3 {
        tokio::time::sleep(Duration::from_millis(600)).await;
        table.set("round", &round.to_string()).await;
    }
    assert!(!handle.is_finished());
    assert_eq!(table.get("round").await, "2");

    let report = timeout(Duration::from_secs(4), handle.join()).await??;
    assert_eq!(report.requests_served, 4);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn unbindable_socket_path_fails_to_start() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let settings = settings(&dir, 60);
    // A directory where the socket should be cannot be cleared away.
    std::fs::create_dir(settings.socket_path())?;

    let result = Server::bind(&settings, ServerMode::Daemon, Arc::new(SystemClock), &LogNotifier).await;
    assert!(result.is_err());
    Ok(())
}
