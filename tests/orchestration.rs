#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aglauncher::agl::settings::LauncherSettings;
use aglauncher::agl::state;
use aglauncher::agl::supervisor::{ServiceState, Supervisor};

fn settings_for(dir: &Path) -> Arc<LauncherSettings> {
    Arc::new(LauncherSettings {
        folder: dir.join("services.d"),
        ext: ".yml".to_string(),
        http_timeout_ms: 200,
        state_file: dir.join("agl.state"),
        html_title: Some("test-node".to_string()),
        start_timeout_sec: 10,
        log_path: dir.join("logs"),
        params: String::new(),
        base_dir: dir.to_path_buf(),
    })
}

fn write_manifest(dir: &Path, file: &str, yaml: &str) {
    let folder = dir.join("services.d");
    std::fs::create_dir_all(&folder).expect("create manifest folder");
    std::fs::write(folder.join(file), yaml).expect("write manifest");
}

async fn wait_until<F: Fn() -> bool>(what: &str, budget: Duration, cond: F) {
    let deadline = Instant::now() + budget;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn levels_start_in_order_and_stop_cleans_up() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let dir = tmp.path();
    let a_marker = dir.join("a.marker");
    let b_ok = dir.join("b.ok");

    write_manifest(
        dir,
        "a.yml",
        &format!(
            "Name: alpha\nLevel: 10\nRun: \"touch {}; sleep 30\"\n",
            a_marker.display()
        ),
    );
    // beta spawns 300 ms after the level barrier released it, and records
    // whether alpha's marker was already on disk at that point.
    write_manifest(
        dir,
        "b.yml",
        &format!(
            "Name: beta\nLevel: 20\nStart: [\"sleep:300\", \"start\"]\nRun: \"test -f {} && touch {}; sleep 30\"\n",
            a_marker.display(),
            b_ok.display()
        ),
    );

    let sup = Supervisor::new(settings_for(dir)).expect("supervisor");
    sup.start().await.expect("start");

    for svc in sup.services() {
        assert_eq!(svc.state_snapshot().0, ServiceState::Running, "{}", svc.name());
        assert!(!svc.started().is_empty());
        assert!(svc.runner_attached());
    }
    wait_until("beta to observe alpha's marker", Duration::from_secs(5), || {
        b_ok.exists()
    })
    .await;

    // Start is idempotent.
    sup.start().await.expect("second start");

    // The state file carries our magic and both services.
    let state_path = sup.state_file_path().await;
    wait_until("state file to appear", Duration::from_secs(5), || {
        state::read_state_file(&state_path).is_ok()
    })
    .await;
    let records = state::read_state_file(&state_path).expect("read state");
    let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);

    sup.stop().await.expect("stop");
    for svc in sup.services() {
        assert_eq!(svc.state_snapshot().0, ServiceState::Stopped, "{}", svc.name());
        assert!(svc.started().is_empty());
        assert!(!svc.runner_attached());
    }
    assert!(!state_path.exists(), "state file must be deleted on stop");
    let html = state::html_file_path(&state_path);
    assert!(html.exists(), "HTML view must survive the stop");

    // Stop is idempotent.
    sup.stop().await.expect("second stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_exit_code_parks_the_runner_until_resume() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let dir = tmp.path();
    let count = dir.join("spawns");

    write_manifest(
        dir,
        "flappy.yml",
        &format!(
            "Name: flappy\nLevel: 10\nRun: \"echo x >> {}; exit 42\"\nRetryStableSec: 10\nAbortExitCodes: [42]\n",
            count.display()
        ),
    );

    let mut settings = (*settings_for(dir)).clone();
    // The child exits immediately, so the Running barrier cannot be waited on.
    settings.start_timeout_sec = 0;
    let sup = Supervisor::new(Arc::new(settings)).expect("supervisor");
    sup.start().await.expect("start");

    let svc = sup
        .services()
        .into_iter()
        .find(|s| s.name() == "flappy")
        .expect("flappy loaded");

    wait_until("runner to park on the abort exit code", Duration::from_secs(10), || {
        svc.state_snapshot() == (ServiceState::Paused, "Wait for abort or /retry".to_string())
    })
    .await;
    assert_eq!(svc.exit_code(), Some(42));
    let spawns_before = std::fs::read_to_string(&count).unwrap_or_default().lines().count();
    assert_eq!(spawns_before, 1, "no auto-restart on an abort exit code");

    // A paused runner stays paused until retry is signaled.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let spawns_still = std::fs::read_to_string(&count).unwrap_or_default().lines().count();
    assert_eq!(spawns_still, 1);

    sup.resume();
    wait_until("retry to respawn the child", Duration::from_secs(10), || {
        std::fs::read_to_string(&count).unwrap_or_default().lines().count() >= 2
    })
    .await;

    sup.stop().await.expect("stop");
    assert!(!svc.runner_attached());
    assert!(svc.started().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn foreign_state_file_aborts_start_and_is_preserved() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let dir = tmp.path();
    write_manifest(dir, "a.yml", "Name: alpha\nLevel: 10\nRun: \"sleep 30\"\n");

    let settings = settings_for(dir);
    std::fs::write(&settings.state_file, b"user data, not ours").expect("plant foreign file");

    let sup = Supervisor::new(Arc::clone(&settings)).expect("supervisor");
    let err = sup.start().await.expect_err("start must refuse").to_string();
    assert!(err.contains("not ours"), "{err}");

    // The foreign file is untouched and the supervisor moved elsewhere.
    let content = std::fs::read(&settings.state_file).expect("foreign file still present");
    assert_eq!(content, b"user data, not ours");
    assert_ne!(sup.state_file_path().await, settings.state_file);
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_actions_flip_state_between_running_and_failed() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let dir = tmp.path();
    let healthy = dir.join("healthy.flag");

    write_manifest(
        dir,
        "probe.yml",
        &format!(
            "Name: probe\nLevel: 10\nStart: [\"exec:true\"]\nWatch: [\"wait:test -f {}\"]\nWatchDelaySec: 1\n",
            healthy.display()
        ),
    );

    let sup = Supervisor::new(settings_for(dir)).expect("supervisor");
    sup.start().await.expect("start");

    let svc = sup
        .services()
        .into_iter()
        .find(|s| s.name() == "probe")
        .expect("probe loaded");

    // No flag file yet: the probe fails.
    wait_until("watch to report Failed", Duration::from_secs(10), || {
        let (st, info) = svc.state_snapshot();
        st == ServiceState::Failed && info.contains("expected 0")
    })
    .await;

    std::fs::write(&healthy, b"ok").expect("write flag");
    wait_until("watch to report Running", Duration::from_secs(10), || {
        svc.state_snapshot().0 == ServiceState::Running
    })
    .await;

    sup.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn monitored_output_lands_in_the_redirect_file() {
    let tmp = tempfile::tempdir().expect("tmpdir");
    let dir = tmp.path();
    let redirect: PathBuf = dir.join("logs").join("echoer.out");

    write_manifest(
        dir,
        "echoer.yml",
        &format!(
            "Name: echoer\nLevel: 10\nRun: \"echo captured-line; sleep 30\"\nRedirectLogFile: \"{}\"\n",
            redirect.display()
        ),
    );

    let sup = Supervisor::new(settings_for(dir)).expect("supervisor");
    sup.start().await.expect("start");

    wait_until("console output to be captured", Duration::from_secs(10), || {
        std::fs::read_to_string(&redirect)
            .map(|s| s.contains("captured-line"))
            .unwrap_or(false)
    })
    .await;

    sup.stop().await.expect("stop");
}
