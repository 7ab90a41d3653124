//! Integration tests for the engine lifecycle: spawn-on-submit, ordered
//! completion, idempotent stop, idle shutdown, and debug mode.
//!
//! The engine is pointed at the built `file-courier` binary via
//! `worker_program`, so these tests exercise the real process boundary:
//! pipes, demultiplexer, outstanding-count accounting, and the idle timer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use file_courier::engine::{Engine, EngineEvent};
use file_courier::wire::frame::{OverwritePolicy, Task};
use file_courier::{AppError, GlobalConfig};

fn test_engine(
    idle_timeout_seconds: u64,
    debug: bool,
) -> (Arc<Engine>, mpsc::Receiver<EngineEvent>) {
    engine_with_program(
        idle_timeout_seconds,
        debug,
        PathBuf::from(env!("CARGO_BIN_EXE_file-courier")),
    )
}

fn engine_with_program(
    idle_timeout_seconds: u64,
    debug: bool,
    worker_program: PathBuf,
) -> (Arc<Engine>, mpsc::Receiver<EngineEvent>) {
    let config = GlobalConfig {
        idle_timeout_seconds,
        debug,
        worker_program: Some(worker_program),
    };
    let (tx, rx) = mpsc::channel(64);
    (Arc::new(Engine::new(config, tx)), rx)
}

/// Write an executable shell script standing in for the worker binary.
#[cfg(unix)]
fn fake_worker(dir: &std::path::Path, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-worker.sh");
    std::fs::write(&path, script).expect("write fake worker script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("make fake worker executable");
    path
}

fn copy_task(src: PathBuf, dest: PathBuf) -> Task {
    Task::Copy {
        sources: vec![src],
        dest,
        overwrite: OverwritePolicy::Always,
    }
}

/// Receive events until the next worker notification, failing after 10 s.
async fn next_notification(rx: &mut mpsc::Receiver<EngineEvent>) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for a notification")
            .expect("event channel closed");
        if let EngineEvent::Notification(text) = event {
            return text;
        }
    }
}

/// Receive events until the next diagnostic line, failing after 10 s.
async fn next_diagnostic(rx: &mut mpsc::Receiver<EngineEvent>) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for a diagnostic")
            .expect("event channel closed");
        if let EngineEvent::Diagnostic(text) = event {
            return text;
        }
    }
}

/// Poll until the outstanding count drains to zero.
async fn wait_until_drained(engine: &Arc<Engine>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while engine.outstanding().await != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "outstanding count never drained to zero"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until the worker process is gone.
async fn wait_until_worker_stopped(engine: &Arc<Engine>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while engine.worker_running().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker never stopped"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Submitting with no worker spawns one, the task completes, and the
/// outstanding count drains back to zero.
#[tokio::test]
async fn submit_spawns_worker_and_completes_task() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("a.txt");
    let dst = dir.path().join("b.txt");
    std::fs::write(&src, "payload").expect("fixture");

    let (engine, mut rx) = test_engine(30, false);
    assert!(!engine.worker_running().await);

    engine
        .submit(copy_task(src, dst.clone()))
        .await
        .expect("submit");
    assert!(
        engine.worker_running().await,
        "submit must have spawned a worker"
    );

    let notification = next_notification(&mut rx).await;
    assert!(
        notification.starts_with("done:"),
        "got: {notification}"
    );
    wait_until_drained(&engine).await;

    let copied = std::fs::read_to_string(&dst).expect("copied file");
    assert_eq!(copied, "payload");

    engine.stop().await;
}

/// Three quick submissions complete strictly in submission order and the
/// count reaches zero only after all three sentinels.
#[tokio::test]
async fn three_submits_complete_in_order_and_drain() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("src.txt");
    std::fs::write(&src, "ordered").expect("fixture");

    let (engine, mut rx) = test_engine(30, false);

    for n in 1..=3 {
        engine
            .submit(copy_task(
                src.clone(),
                dir.path().join(format!("copy-{n}.txt")),
            ))
            .await
            .expect("submit");
    }

    for n in 1..=3 {
        let notification = next_notification(&mut rx).await;
        assert!(
            notification.contains(&format!("copy-{n}.txt")),
            "completion {n} out of order, got: {notification}"
        );
    }
    wait_until_drained(&engine).await;

    for n in 1..=3 {
        assert!(dir.path().join(format!("copy-{n}.txt")).exists());
    }

    engine.stop().await;
}

/// `stop` with no worker is a no-op that can be repeated freely.
#[tokio::test]
async fn stop_is_idempotent_without_worker() {
    let (engine, _rx) = test_engine(30, false);

    engine.stop().await;
    engine.stop().await;

    assert_eq!(engine.outstanding().await, 0);
    assert!(!engine.worker_running().await);
}

/// `stop` with work in flight kills the worker, resets the count, and a
/// later submission starts over with a fresh worker.
#[tokio::test]
async fn stop_discards_outstanding_work_and_resubmit_respawns() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("a.txt");
    std::fs::write(&src, "x").expect("fixture");

    let (engine, mut rx) = test_engine(30, false);

    engine
        .submit(copy_task(src.clone(), dir.path().join("c1.txt")))
        .await
        .expect("submit");
    engine
        .submit(copy_task(src.clone(), dir.path().join("c2.txt")))
        .await
        .expect("submit");

    engine.stop().await;
    assert_eq!(
        engine.outstanding().await,
        0,
        "stop must reset the outstanding count"
    );
    assert!(!engine.worker_running().await);

    // A late sentinel from the killed worker must not drive the count
    // negative — the next submission starts from a clean slate.
    engine
        .submit(copy_task(src, dir.path().join("after-stop.txt")))
        .await
        .expect("resubmit after stop");
    let notification = next_notification(&mut rx).await;
    assert!(notification.contains("after-stop.txt"), "got: {notification}");
    wait_until_drained(&engine).await;

    engine.stop().await;
}

/// Once the count drains to zero the idle timer fires and stops the
/// worker without any explicit call.
#[tokio::test]
async fn idle_timeout_stops_worker_after_drain() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("a.txt");
    std::fs::write(&src, "x").expect("fixture");

    let (engine, mut rx) = test_engine(1, false);

    engine
        .submit(copy_task(src, dir.path().join("b.txt")))
        .await
        .expect("submit");
    let _ = next_notification(&mut rx).await;

    wait_until_worker_stopped(&engine).await;
    assert_eq!(engine.outstanding().await, 0);
}

/// A submission while the idle timer is pending disarms it: the worker
/// survives past the original deadline.
#[tokio::test]
async fn submit_disarms_pending_idle_timer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("a.txt");
    std::fs::write(&src, "x").expect("fixture");

    let (engine, mut rx) = test_engine(3, false);

    // First task drains; the timer arms at ~t0 and would fire at ~t0+3s.
    engine
        .submit(copy_task(src.clone(), dir.path().join("c1.txt")))
        .await
        .expect("submit");
    let _ = next_notification(&mut rx).await;
    wait_until_drained(&engine).await;

    // Second task at ~t0+1.5s disarms the pending timer and re-arms on
    // completion, pushing the deadline to ~t0+4.5s.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    engine
        .submit(copy_task(src, dir.path().join("c2.txt")))
        .await
        .expect("submit");
    let _ = next_notification(&mut rx).await;
    wait_until_drained(&engine).await;

    // At ~t0+3.5s the original deadline has passed; the worker must still
    // be alive because the first timer was disarmed.
    tokio::time::sleep(Duration::from_millis(1900)).await;
    assert!(
        engine.worker_running().await,
        "the disarmed timer must not have fired"
    );

    engine.stop().await;
}

/// A task rejected at encode time leaves the accounting untouched: the
/// count stays at zero and the pending idle shutdown still fires, so the
/// worker never leaks behind a permanently inflated count.
#[tokio::test]
async fn rejected_task_leaves_count_and_idle_shutdown_intact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("a.txt");
    std::fs::write(&src, "x").expect("fixture");

    let (engine, mut rx) = test_engine(1, false);

    engine
        .submit(copy_task(src, dir.path().join("b.txt")))
        .await
        .expect("submit");
    let _ = next_notification(&mut rx).await;
    wait_until_drained(&engine).await;

    let result = engine
        .submit(copy_task(
            PathBuf::from("bad\nname.txt"),
            dir.path().join("c.txt"),
        ))
        .await;
    assert!(
        matches!(result, Err(AppError::Protocol(_))),
        "a newline-bearing path must be rejected at encode, got: {result:?}"
    );
    assert_eq!(
        engine.outstanding().await,
        0,
        "a rejected task must not count as outstanding"
    );

    // The idle timer armed at the drain must still stop the worker.
    wait_until_worker_stopped(&engine).await;
}

/// A write to a worker whose stdin is gone surfaces as a transmit error
/// plus an error event; the count is not rolled back, and once the dead
/// worker is noticed the next submission respawns and succeeds.
#[cfg(unix)]
#[tokio::test]
async fn transmit_failure_surfaces_error_and_resubmit_respawns() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Consumes the bootstrap frame and one task, closes its stdin,
    // lingers, then exits.
    let program = fake_worker(
        dir.path(),
        "#!/bin/sh\nread a\nread b\nexec 0<&-\nsleep 2\n",
    );
    let (engine, mut rx) = engine_with_program(30, false, program);

    let src = dir.path().join("a.txt");
    std::fs::write(&src, "x").expect("fixture");

    engine
        .submit(copy_task(src.clone(), dir.path().join("b.txt")))
        .await
        .expect("first submit reaches the worker");

    // Give the script time to close its end of the pipe.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let result = engine
        .submit(copy_task(src.clone(), dir.path().join("c.txt")))
        .await;
    assert!(
        matches!(result, Err(AppError::Transmit(_))),
        "a write to a closed pipe must surface as a transmit error, got: {result:?}"
    );
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for the error event")
            .expect("event channel closed");
        if let EngineEvent::Error(text) = event {
            assert!(text.contains("transmit"), "got: {text}");
            break;
        }
    }
    assert_eq!(
        engine.outstanding().await,
        2,
        "transmit failures are not rolled back"
    );

    // Once the dead worker is noticed, submission starts over cleanly.
    wait_until_worker_stopped(&engine).await;
    engine
        .submit(copy_task(src, dir.path().join("d.txt")))
        .await
        .expect("resubmit must respawn the worker");
    assert!(engine.worker_running().await);
    assert_eq!(
        engine.outstanding().await,
        1,
        "a respawn starts from a clean count"
    );

    engine.stop().await;
}

/// While a task write is backed up on a saturated stdin pipe, the engine's
/// state stays reachable: introspection (and with it the demultiplexer's
/// sentinel accounting, which takes the same lock) must not wait behind
/// the pipe.
#[cfg(unix)]
#[tokio::test]
async fn engine_stays_responsive_while_task_write_is_backed_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Never reads its stdin, so the pipe fills and the write backs up.
    let program = fake_worker(dir.path(), "#!/bin/sh\nsleep 10\n");
    let (engine, _rx) = engine_with_program(30, false, program);
    engine.start().await.expect("start");

    // A task large enough to overrun the pipe's buffer.
    let sources: Vec<PathBuf> = (0..4096)
        .map(|n| PathBuf::from(format!("/data/source-file-with-a-long-name-{n:05}.bin")))
        .collect();
    let task = Task::Copy {
        sources,
        dest: PathBuf::from("/backup"),
        overwrite: OverwritePolicy::Always,
    };

    let writer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.submit(task).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        !writer.is_finished(),
        "the oversized write must still be in flight"
    );

    let outstanding = tokio::time::timeout(Duration::from_secs(2), engine.outstanding())
        .await
        .expect("engine state must stay reachable during a backed-up write");
    assert_eq!(outstanding, 1);

    // Stopping kills the worker, which unblocks and fails the write.
    engine.stop().await;
    let result = tokio::time::timeout(Duration::from_secs(10), writer)
        .await
        .expect("writer task must finish after stop")
        .expect("writer task must not panic");
    assert!(
        result.is_err(),
        "the interrupted write must surface an error"
    );
}

/// Debug mode mirrors all worker output as diagnostics (echo included)
/// and never auto-stops the worker.
#[tokio::test]
async fn debug_mode_mirrors_output_and_never_auto_stops() {
    let dir = tempfile::tempdir().expect("tempdir");
    let src = dir.path().join("a.txt");
    std::fs::write(&src, "x").expect("fixture");

    let (engine, mut rx) = test_engine(1, true);

    engine
        .submit(copy_task(src, dir.path().join("b.txt")))
        .await
        .expect("submit");

    let echo = next_diagnostic(&mut rx).await;
    assert!(
        echo.contains("executing:"),
        "debug mode must echo the task before execution, got: {echo}"
    );
    let done = next_diagnostic(&mut rx).await;
    assert!(done.contains("done:"), "got: {done}");
    let sentinel = next_diagnostic(&mut rx).await;
    assert_eq!(
        sentinel, "***IDLE***",
        "mirror mode must surface the sentinel instead of consuming it"
    );

    // Well past the 1 s idle timeout the worker must still be running.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(
        engine.worker_running().await,
        "debug mode must disable the idle auto-stop"
    );

    engine.stop().await;
}
