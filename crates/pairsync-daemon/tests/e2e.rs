//! End-to-end tests for pairsync-daemon.
//!
//! Runs two peers in one process over loopback TCP: role negotiation,
//! recovery after a lost peer, and full bidirectional file sync.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use pairsync_core::Recorder;
use pairsync_daemon::{Daemon, Mode, PeerLink, SyncConfig};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(20);

// ============================================================================
// Helpers
// ============================================================================

/// Find a port nobody is listening on.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    listener.local_addr().expect("Failed to get local addr").port()
}

fn test_config(root: &Path, port: u16) -> SyncConfig {
    SyncConfig {
        port,
        listen_host: "127.0.0.1".to_string(),
        root: root.to_path_buf(),
        receive_buffer_size: 4096,
        accept_timeout_secs: 1,
        retry_delay_ms: 50,
        idle_interval_ms: 50,
        ..SyncConfig::default()
    }
}

fn test_link(port: u16) -> PeerLink {
    PeerLink::new(test_config(Path::new("."), port).link_config("127.0.0.1"))
}

/// Start a full peer rooted at `root` in the background.
fn spawn_peer(root: &Path, port: u16) -> JoinHandle<anyhow::Result<()>> {
    let config = test_config(root, port);
    fs::create_dir_all(config.share_path()).expect("Failed to create share dir");
    let recorder = Recorder::open(&config.root, &config.share_dir, &config.record_file)
        .expect("Failed to open recorder");
    let link = PeerLink::new(config.link_config("127.0.0.1"));
    let mut daemon = Daemon::new(link, recorder, &config);

    tokio::spawn(async move { daemon.run().await })
}

fn write_file(root: &Path, path: &str, contents: &[u8]) -> PathBuf {
    let full = root.join(path);
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(&full, contents).unwrap();
    full
}

/// Rewrite a file and push its mtime forward so the change is always visible.
fn modify_file(path: &Path, contents: &[u8], bump: Duration) {
    fs::write(path, contents).unwrap();
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + bump).unwrap();
}

/// Wait until `path` holds `contents` and its transfer record is complete.
async fn wait_for_synced(root: &Path, path: &str, contents: &[u8]) {
    let full = root.join(path);
    let result = timeout(WAIT, async {
        loop {
            let content_matches = fs::read(&full).ok().as_deref() == Some(contents);
            let record_complete = Recorder::open(root, "share", "sync_record.json")
                .ok()
                .and_then(|r| r.get(path).map(|rec| rec.is_complete()))
                .unwrap_or(false);
            if content_matches && record_complete {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Timed out waiting for {} to sync", path);
}

fn assert_one_of_each(a: Mode, b: Mode) {
    assert!(
        matches!((a, b), (Mode::Client, Mode::Server) | (Mode::Server, Mode::Client)),
        "Expected one client and one server, got {:?} and {:?}",
        a,
        b
    );
}

// ============================================================================
// Role negotiation
// ============================================================================

#[tokio::test]
async fn test_bootstrap_race_converges() {
    let port = free_port();
    let mut a = test_link(port);
    let mut b = test_link(port);

    timeout(WAIT, async { tokio::join!(a.start(), b.start()) })
        .await
        .expect("Bootstrap should converge");

    assert_one_of_each(a.mode(), b.mode());
    assert!(a.stream_mut().is_some());
    assert!(b.stream_mut().is_some());
}

#[tokio::test]
async fn test_late_peer_becomes_client() {
    let port = free_port();
    let mut early = test_link(port);
    let mut late = test_link(port);

    let early_task = tokio::spawn(async move {
        early.start().await;
        early
    });
    sleep(Duration::from_millis(200)).await;

    timeout(WAIT, late.start()).await.expect("Late peer should connect");
    let early = timeout(WAIT, early_task).await.unwrap().unwrap();

    assert_eq!(late.mode(), Mode::Client);
    assert_eq!(early.mode(), Mode::Server);
}

#[tokio::test]
async fn test_server_reaccepts_after_client_loss() {
    let port = free_port();
    let mut a = test_link(port);
    let mut b = test_link(port);
    timeout(WAIT, async { tokio::join!(a.start(), b.start()) })
        .await
        .unwrap();

    let (mut server, client) = if a.mode() == Mode::Server { (a, b) } else { (b, a) };
    drop(client);

    let mut replacement = test_link(port);
    timeout(WAIT, async { tokio::join!(server.resume(), replacement.start()) })
        .await
        .expect("Server should accept the returning peer");

    assert_eq!(server.mode(), Mode::Server);
    assert_eq!(replacement.mode(), Mode::Client);
}

#[tokio::test]
async fn test_client_recovers_after_server_loss() {
    let port = free_port();
    let mut a = test_link(port);
    let mut b = test_link(port);
    timeout(WAIT, async { tokio::join!(a.start(), b.start()) })
        .await
        .unwrap();

    let (server, mut client) = if a.mode() == Mode::Server { (a, b) } else { (b, a) };
    drop(server);

    let mut replacement = test_link(port);
    timeout(WAIT, async { tokio::join!(client.resume(), replacement.start()) })
        .await
        .expect("Client should find the returning peer");

    assert_one_of_each(client.mode(), replacement.mode());
}

// ============================================================================
// Full sync
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bidirectional_sync() {
    let port = free_port();
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();

    let a_file = write_file(a_dir.path(), "share/from_a.txt", b"hello from a");
    write_file(b_dir.path(), "share/docs/from_b.md", b"# hello from b");
    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    write_file(a_dir.path(), "share/big.bin", &big);

    let peer_a = spawn_peer(a_dir.path(), port);
    let peer_b = spawn_peer(b_dir.path(), port);

    wait_for_synced(b_dir.path(), "share/from_a.txt", b"hello from a").await;
    wait_for_synced(b_dir.path(), "share/big.bin", &big).await;
    wait_for_synced(a_dir.path(), "share/docs/from_b.md", b"# hello from b").await;

    // A later edit on A reaches B
    modify_file(&a_file, b"edited on a", Duration::from_secs(60));
    wait_for_synced(b_dir.path(), "share/from_a.txt", b"edited on a").await;

    peer_a.abort();
    peer_b.abort();

    let b_records = Recorder::open(b_dir.path(), "share", "sync_record.json").unwrap();
    assert!(!b_records.get("share/from_a.txt").unwrap().ownership);
    let a_records = Recorder::open(a_dir.path(), "share", "sync_record.json").unwrap();
    assert!(a_records.get("share/from_a.txt").unwrap().ownership);
    assert!(!a_records.get("share/docs/from_b.md").unwrap().ownership);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_resumes_after_peer_restart() {
    let port = free_port();
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();

    write_file(a_dir.path(), "share/first.txt", b"first");

    let peer_a = spawn_peer(a_dir.path(), port);
    let peer_b = spawn_peer(b_dir.path(), port);
    wait_for_synced(b_dir.path(), "share/first.txt", b"first").await;

    // B goes away; A keeps running and must recover on its own.
    peer_b.abort();
    let _ = peer_b.await;

    write_file(b_dir.path(), "share/second.txt", b"written while offline");
    let peer_b = spawn_peer(b_dir.path(), port);

    wait_for_synced(a_dir.path(), "share/second.txt", b"written while offline").await;
    assert!(!peer_a.is_finished(), "A should never stop on network failure");

    peer_a.abort();
    peer_b.abort();
}
