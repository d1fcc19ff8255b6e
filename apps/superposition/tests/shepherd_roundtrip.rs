//! Supervisor round-trip tests: a real daemon on a scratch socket, driven
//! through the client over the framed protocol.

use std::path::Path;
use std::time::Duration;

use superposition::config::DataPaths;
use superposition::session::{SessionHandle, SessionManager, Subscription};
use superposition::shepherd::daemon::{self, ShepherdError};
use superposition::shepherd::ShepherdClient;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

struct DaemonFixture {
    paths: DataPaths,
    _dir: TempDir,
    task: tokio::task::JoinHandle<Result<(), ShepherdError>>,
}

async fn start_daemon() -> DaemonFixture {
    let dir = TempDir::new().expect("scratch dir");
    let paths = DataPaths::at(dir.path().to_path_buf());
    let daemon_paths = paths.clone();
    let task = tokio::spawn(async move { daemon::run(&daemon_paths).await });

    for _ in 0..200 {
        if paths.shepherd_socket().exists() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(paths.shepherd_socket().exists(), "daemon never bound");

    DaemonFixture {
        paths,
        _dir: dir,
        task,
    }
}

async fn connect(fixture: &DaemonFixture) -> ShepherdClient {
    ShepherdClient::connect(&fixture.paths.shepherd_socket())
        .await
        .expect("connect to daemon")
}

async fn drain(mut sub: Subscription) -> Vec<u8> {
    let mut collected = Vec::new();
    loop {
        match timeout(WAIT, sub.recv()).await {
            Ok(Some(chunk)) => collected.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    collected
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .filter(|window| *window == needle)
        .count()
}

#[tokio::test]
async fn ping_and_empty_list() {
    let fixture = start_daemon().await;
    let client = connect(&fixture).await;

    client.ping().await.expect("pong");
    let sessions = client.list_sessions().await.expect("list");
    assert!(sessions.is_empty());

    client.close().await;
    fixture.task.abort();
}

#[tokio::test]
async fn session_lifecycle_through_the_daemon() {
    let fixture = start_daemon().await;
    let client = connect(&fixture).await;

    let (handle, pid) = client
        .start("abc", "sh", Path::new("/tmp"))
        .await
        .expect("start session");
    assert!(pid > 0);
    assert_eq!(client.list_sessions().await.expect("list"), vec!["abc"]);

    let sub = handle.subscribe().await;
    handle
        .write(b"printf 'K%sL' wire; exit\n")
        .await
        .expect("write input");

    // The exited notification drives done() on the client side.
    timeout(WAIT, handle.done()).await.expect("exit notification");

    let bytes = drain(sub).await;
    assert!(
        String::from_utf8_lossy(&bytes).contains("KwireL"),
        "subscriber missed output: {:?}",
        String::from_utf8_lossy(&bytes)
    );

    // The daemon drops the session from its table after broadcasting.
    for _ in 0..200 {
        if client.list_sessions().await.expect("list").is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(client.list_sessions().await.expect("list").is_empty());

    client.close().await;
    fixture.task.abort();
}

#[tokio::test]
async fn replay_round_trips_over_the_socket() {
    let fixture = start_daemon().await;
    let client = connect(&fixture).await;

    let (handle, _) = client
        .start("rep", "sh", Path::new("/tmp"))
        .await
        .expect("start session");
    handle
        .write(b"printf 'M%sN' persisted\n")
        .await
        .expect("write input");

    // Poll the replay buffer until the output landed in the shepherd.
    let mut seen = false;
    for _ in 0..200 {
        let replay = handle.replay().await;
        if String::from_utf8_lossy(&replay).contains("MpersistedN") {
            seen = true;
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    assert!(seen, "replay never contained the marker");

    client.stop("rep").await.expect("stop");
    client.close().await;
    fixture.task.abort();
}

#[tokio::test]
async fn duplicate_local_subscribes_share_one_remote_subscription() {
    let fixture = start_daemon().await;
    let client = connect(&fixture).await;

    let (handle, _) = client
        .start("dup-sub", "sh", Path::new("/tmp"))
        .await
        .expect("start session");

    // Two local fan-outs; only the first may register with the shepherd,
    // otherwise each chunk would arrive twice.
    let sub_a = handle.subscribe().await;
    let sub_b = handle.subscribe().await;

    handle
        .write(b"printf 'O%sP' solo; exit\n")
        .await
        .expect("write input");
    timeout(WAIT, handle.done()).await.expect("exit notification");

    let bytes_a = drain(sub_a).await;
    let bytes_b = drain(sub_b).await;
    assert_eq!(count_occurrences(&bytes_a, b"OsoloP"), 1);
    assert_eq!(count_occurrences(&bytes_b, b"OsoloP"), 1);

    client.close().await;
    fixture.task.abort();
}

#[tokio::test]
async fn stop_on_unknown_session_returns_stop_done() {
    let fixture = start_daemon().await;
    let client = connect(&fixture).await;

    client.stop("ghost").await.expect("stop unknown is a no-op");

    client.close().await;
    fixture.task.abort();
}

#[tokio::test]
async fn stop_all_clears_the_session_table() {
    let fixture = start_daemon().await;
    let client = connect(&fixture).await;

    client
        .start("sa-1", "sh", Path::new("/tmp"))
        .await
        .expect("start first");
    client
        .start("sa-2", "sh", Path::new("/tmp"))
        .await
        .expect("start second");

    client.stop_all().await;

    for _ in 0..200 {
        if client.list_sessions().await.expect("list").is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(client.list_sessions().await.expect("list").is_empty());

    client.close().await;
    fixture.task.abort();
}

#[tokio::test]
async fn second_daemon_refuses_to_start() {
    let fixture = start_daemon().await;

    let err = daemon::run(&fixture.paths)
        .await
        .expect_err("second daemon must refuse");
    assert!(matches!(err, ShepherdError::AlreadyRunning));

    fixture.task.abort();
}

#[tokio::test]
async fn exited_notifications_reach_every_client() {
    let fixture = start_daemon().await;
    let starter = connect(&fixture).await;
    let watcher = connect(&fixture).await;

    let (handle, _) = starter
        .start("watched", "sh", Path::new("/tmp"))
        .await
        .expect("start session");

    // The second client learns about the session and waits for its exit.
    let mut done_rx = watcher.adopt("watched");

    handle.write(b"exit\n").await.expect("write exit");
    timeout(WAIT, handle.done()).await.expect("starter sees exit");
    timeout(WAIT, async {
        let _ = done_rx.wait_for(|done| *done).await;
    })
    .await
    .expect("watcher sees exit");

    starter.close().await;
    watcher.close().await;
    fixture.task.abort();
}
