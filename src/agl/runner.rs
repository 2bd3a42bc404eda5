use anyhow::Context as _;
use rand::Rng as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt as _;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::agl::asyncutil::tasks;
use crate::agl::eventlog::agl_event;
use crate::agl::redirect::RedirectWriter;
use crate::agl::supervisor::{ServiceState, SubService};

/// Signals a live Runner understands. `Abort` ends the Runner for good;
/// `Retry` releases a paused Runner for an immediate respawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunnerSignal {
    Abort,
    Retry,
}

/// Cheap handle kept on the sub-service while its Runner is alive. Cleared
/// by the Runner itself when its loop exits.
#[derive(Debug, Clone)]
pub(crate) struct RunnerHandle {
    pub tx: mpsc::UnboundedSender<RunnerSignal>,
    pub abort: Arc<AtomicBool>,
}

impl RunnerHandle {
    pub fn signal(&self, sig: RunnerSignal) {
        if sig == RunnerSignal::Abort {
            self.abort.store(true, Ordering::SeqCst);
        }
        let _ = self.tx.send(sig);
    }
}

#[derive(Debug, Clone)]
pub struct RedirectConfig {
    pub path: PathBuf,
    pub rotate_files: usize,
    pub rotate_bytes: u64,
}

/// Everything a Runner needs, copied out of the manifest up front: the
/// sub-service may be torn down at any time, so the Runner never re-reads it.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub name: String,
    pub command: String,
    pub env: Vec<(String, String)>,
    pub replace_env: bool,
    pub work_dir: Option<PathBuf>,
    pub redirect: Option<RedirectConfig>,
    pub retry_stable_sec: u64,
    pub abort_exit_codes: Vec<i32>,
    pub stop_timeout: Duration,
}

/// Pause ladder for unstable runs: the longer a service has been flapping,
/// the longer the pause, capped at 240 s.
pub(crate) fn unstable_pause_secs(unstable_for_min: u64) -> u64 {
    if unstable_for_min > 60 {
        240
    } else if unstable_for_min > 30 {
        120
    } else if unstable_for_min > 10 {
        60
    } else if unstable_for_min > 5 {
        30
    } else if unstable_for_min >= 1 {
        15
    } else {
        2
    }
}

/// Start a monitored Runner for `sub`. The handle is stored on the
/// sub-service before the worker task starts, so `runner != nil` holds from
/// the caller's perspective for the whole monitored lifetime.
pub(crate) fn launch(cfg: RunnerConfig, sub: &Arc<SubService>) -> RunnerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let abort = Arc::new(AtomicBool::new(false));
    let handle = RunnerHandle {
        tx,
        abort: Arc::clone(&abort),
    };
    sub.set_runner(handle.clone());
    let weak = Arc::downgrade(sub);
    tasks().spawn(run_loop(cfg, weak, rx, abort));
    handle
}

async fn run_loop(
    cfg: RunnerConfig,
    sub: Weak<SubService>,
    mut rx: mpsc::UnboundedReceiver<RunnerSignal>,
    abort: Arc<AtomicBool>,
) {
    let mut first_unstable: Option<Instant> = None;
    loop {
        if abort.load(Ordering::SeqCst) {
            break;
        }
        let Some(s) = sub.upgrade() else { break };
        s.set_state(ServiceState::Starting, cfg.command.clone());
        drop(s);

        let start_tick = Instant::now();
        let code = match run_once(&cfg, &sub, &abort, &mut rx).await {
            Ok(code) => {
                if let Some(s) = sub.upgrade() {
                    s.set_exit_code(Some(code));
                    s.set_state(ServiceState::Stopped, format!("ExitCode={code}"));
                }
                Some(code)
            }
            Err(e) => {
                agl_event("runner", Some(&cfg.name), format!("outcome=run_error err={e:#}"));
                if let Some(s) = sub.upgrade() {
                    s.set_state(ServiceState::Failed, format!("{e:#}"));
                }
                None
            }
        };

        if abort.load(Ordering::SeqCst) || sub.upgrade().is_none() {
            break;
        }

        let restart_inhibited = cfg.retry_stable_sec == 0
            || code.map_or(false, |c| cfg.abort_exit_codes.contains(&c));
        if restart_inhibited {
            if let Some(s) = sub.upgrade() {
                s.set_state(ServiceState::Paused, "Wait for abort or /retry");
            }
            match rx.recv().await {
                Some(RunnerSignal::Retry) => continue,
                Some(RunnerSignal::Abort) | None => break,
            }
        }

        if start_tick.elapsed() >= Duration::from_secs(cfg.retry_stable_sec) {
            // Stable run: restart right away and forget the unstable streak.
            first_unstable = None;
            continue;
        }

        let fu = *first_unstable.get_or_insert_with(Instant::now);
        let unstable_for_min = fu.elapsed().as_millis() as u64 / 60_000;
        let pause = unstable_pause_secs(unstable_for_min);
        let jitter_ms = rand::rng().random_range(0..=pause * 100);
        if let Some(s) = sub.upgrade() {
            s.set_state(ServiceState::Paused, format!("Wait {pause} sec"));
        }
        tokio::select! {
            sig = rx.recv() => match sig {
                Some(RunnerSignal::Retry) => {}
                Some(RunnerSignal::Abort) | None => break,
            },
            _ = tokio::time::sleep(Duration::from_millis(pause * 1000 + jitter_ms)) => {}
        }
    }

    if let Some(s) = sub.upgrade() {
        if abort.load(Ordering::SeqCst) {
            let info = match s.exit_code() {
                Some(c) => format!("ExitCode={c}"),
                None => String::new(),
            };
            s.set_state(ServiceState::Stopped, info);
        }
        // Clearing the handle signals "ended" to whoever is polling for us.
        s.clear_runner();
    }
}

fn shell() -> &'static str {
    if cfg!(target_os = "windows") { "cmd" } else { "sh" }
}

fn shell_flag() -> &'static str {
    if cfg!(target_os = "windows") { "/C" } else { "-c" }
}

/// One spawn of the monitored command: pump console output into the redirect
/// file until the child exits, honoring abort with graceful-then-hard
/// termination.
async fn run_once(
    cfg: &RunnerConfig,
    sub: &Weak<SubService>,
    abort: &Arc<AtomicBool>,
    rx: &mut mpsc::UnboundedReceiver<RunnerSignal>,
) -> anyhow::Result<i32> {
    let mut cmd = Command::new(shell());
    cmd.arg(shell_flag()).arg(&cfg.command);
    if cfg.replace_env {
        cmd.env_clear();
    }
    for (k, v) in &cfg.env {
        cmd.env(k, v);
    }
    if let Some(wd) = &cfg.work_dir {
        cmd.current_dir(wd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Own session and process group, so termination reaches descendants too.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            let _ = nix::unistd::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        anyhow::anyhow!(
            "spawn service={} cmd={:?} failed: kind={:?} err={e}",
            cfg.name,
            cfg.command,
            e.kind()
        )
    })?;
    let pid = child.id().unwrap_or(0);
    if let Some(s) = sub.upgrade() {
        s.set_state(ServiceState::Running, format!("PID={pid}"));
    }

    let writer = match &cfg.redirect {
        Some(rc) => {
            match RedirectWriter::open(&cfg.name, rc.path.clone(), rc.rotate_files, rc.rotate_bytes)
                .await
            {
                Ok(w) => Some(Arc::new(tokio::sync::Mutex::new(w))),
                Err(e) => {
                    agl_event(
                        "redirect",
                        Some(&cfg.name),
                        format!("outcome=open_error path={} err={e:#}", rc.path.display()),
                    );
                    None
                }
            }
        }
        None => None,
    };

    // The pipes must be drained even without a redirect file, or the child
    // blocks once the pipe buffer fills up.
    let pump_out = tasks().spawn(pump(child.stdout.take(), writer.clone()));
    let pump_err = tasks().spawn(pump(child.stderr.take(), writer.clone()));

    let status = loop {
        tokio::select! {
            st = child.wait() => break st.with_context(|| format!("wait for service={}", cfg.name))?,
            sig = rx.recv() => match sig {
                Some(RunnerSignal::Retry) => continue,
                Some(RunnerSignal::Abort) | None => {
                    abort.store(true, Ordering::SeqCst);
                    break terminate(&mut child, pid, cfg.stop_timeout).await?;
                }
            }
        }
    };

    let _ = pump_out.await;
    let _ = pump_err.await;
    if let Some(w) = &writer {
        w.lock().await.flush().await;
    }

    Ok(exit_code_of(status))
}

async fn pump<R>(stream: Option<R>, writer: Option<Arc<tokio::sync::Mutex<RedirectWriter>>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let Some(mut r) = stream else { return };
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match r.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(w) = &writer {
                    w.lock().await.write_chunk(&buf[..n]).await;
                }
            }
        }
    }
}

/// Graceful signal first; hard kill once the abort budget elapses.
async fn terminate(
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> anyhow::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(st) => Ok(st.context("wait after SIGTERM")?),
            Err(_) => {
                let _ = killpg(pgid, Signal::SIGKILL);
                Ok(child.wait().await.context("wait after SIGKILL")?)
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = grace;
        let _ = child.start_kill();
        Ok(child.wait().await.context("wait after kill")?)
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_ladder_matches_the_published_table() {
        let cases = [
            (0, 2),
            (1, 15),
            (5, 15),
            (6, 30),
            (10, 30),
            (11, 60),
            (30, 60),
            (31, 120),
            (60, 120),
            (61, 240),
            (600, 240),
        ];
        for (minutes, want) in cases {
            assert_eq!(
                unstable_pause_secs(minutes),
                want,
                "minutes={minutes}"
            );
        }
    }

    #[test]
    fn pause_ladder_is_monotonic_and_capped() {
        let mut prev = 0;
        for m in 0..=120 {
            let p = unstable_pause_secs(m);
            assert!(p >= prev, "ladder must not shrink at minute {m}");
            assert!(p <= 240);
            prev = p;
        }
    }
}
