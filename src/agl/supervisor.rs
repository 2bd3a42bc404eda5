use anyhow::Context as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::agl::action::{self, Action, ActionContext, Verb};
use crate::agl::asyncutil::tasks;
use crate::agl::eventlog::agl_event;
use crate::agl::expand::expand;
use crate::agl::manifest::{self, Manifest};
use crate::agl::runner::{self, RedirectConfig, RunnerConfig, RunnerHandle, RunnerSignal};
use crate::agl::settings::LauncherSettings;
use crate::agl::state::{self, StatePublisher, StateRecord};

const BARRIER_POLL: Duration = Duration::from_millis(10);
const STOP_POLL: Duration = Duration::from_millis(10);

/// Observable state of one sub-service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Paused,
    Failed,
    ErrorRetrievingState,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Stopped => "STOPPED",
            ServiceState::Paused => "PAUSED",
            ServiceState::Failed => "FAILED",
            ServiceState::ErrorRetrievingState => "ERROR_RETRIEVING_STATE",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live record for one loaded sub-service.
///
/// Owned by the Supervisor; its Runner (if any) holds a weak reference back,
/// so teardown of the set can never keep a worker alive on a stale record.
/// `set_state` is best-effort by contract: it never fails and never panics.
#[derive(Debug)]
pub struct SubService {
    pub manifest: Manifest,
    observed: Mutex<(ServiceState, String)>,
    /// Literal parameter of the in-flight monitored start; empty when no
    /// start is active. At most one non-empty value at any time.
    started: Mutex<String>,
    runner: Mutex<Option<RunnerHandle>>,
    runner_exit_code: Mutex<Option<i32>>,
    /// Next watchdog due time (epoch ms); 0 means "no watch scheduled".
    next_watch_ms: AtomicI64,
    publish_tx: mpsc::UnboundedSender<()>,
}

impl SubService {
    fn new(manifest: Manifest, publish_tx: mpsc::UnboundedSender<()>) -> Self {
        Self {
            manifest,
            observed: Mutex::new((ServiceState::Stopped, String::new())),
            started: Mutex::new(String::new()),
            runner: Mutex::new(None),
            runner_exit_code: Mutex::new(None),
            next_watch_ms: AtomicI64::new(0),
            publish_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn set_state(&self, state: ServiceState, info: impl Into<String>) {
        let info = info.into();
        {
            let mut g = self.observed.lock().unwrap_or_else(|p| p.into_inner());
            *g = (state, info.clone());
        }
        agl_event("state", Some(self.name()), format!("state={state} info={info}"));
        let _ = self.publish_tx.send(());
    }

    pub fn state_snapshot(&self) -> (ServiceState, String) {
        self.observed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn started(&self) -> String {
        self.started.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_started(&self, param: &str) {
        *self.started.lock().unwrap_or_else(|p| p.into_inner()) = param.to_string();
    }

    fn clear_started(&self) {
        self.started.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub(crate) fn set_runner(&self, handle: RunnerHandle) {
        *self.runner.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    pub(crate) fn clear_runner(&self) {
        *self.runner.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub(crate) fn runner_handle(&self) -> Option<RunnerHandle> {
        self.runner.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn runner_attached(&self) -> bool {
        self.runner.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    pub(crate) fn set_exit_code(&self, code: Option<i32>) {
        *self.runner_exit_code.lock().unwrap_or_else(|p| p.into_inner()) = code;
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.runner_exit_code.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_watch_ms(&self) -> i64 {
        self.next_watch_ms.load(Ordering::SeqCst)
    }

    fn schedule_next_watch(&self) {
        let due = now_ms() + self.manifest.watch_delay_sec as i64 * 1000;
        self.next_watch_ms.store(due, Ordering::SeqCst);
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The supervisor: owns the loaded sub-service set, drives level-ordered
/// starts and stops, runs the watchdog, and feeds the state publisher.
pub struct Supervisor {
    settings: Arc<LauncherSettings>,
    services: Arc<Mutex<Vec<Arc<SubService>>>>,
    levels: Mutex<Vec<i32>>,
    has_watch: AtomicBool,
    /// True between a Start and the matching Stop. Makes both idempotent and
    /// doubles as the watchdog's shutdown flag.
    active: AtomicBool,
    watchdog_running: AtomicBool,
    publisher: Arc<StatePublisher>,
    publish_tx: mpsc::UnboundedSender<()>,
    http: reqwest::Client,
}

impl Supervisor {
    pub fn new(settings: Arc<LauncherSettings>) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.http_timeout_ms))
            .build()
            .context("build http probe client")?;

        let publisher = Arc::new(StatePublisher::new(
            settings.state_file.clone(),
            settings.html_title.clone(),
        ));
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let services: Arc<Mutex<Vec<Arc<SubService>>>> = Arc::new(Mutex::new(Vec::new()));

        spawn_publish_task(Arc::clone(&publisher), Arc::clone(&services), publish_rx);

        Ok(Arc::new(Self {
            settings,
            services,
            levels: Mutex::new(Vec::new()),
            has_watch: AtomicBool::new(false),
            active: AtomicBool::new(false),
            watchdog_running: AtomicBool::new(false),
            publisher,
            publish_tx,
            http,
        }))
    }

    pub async fn state_file_path(&self) -> PathBuf {
        self.publisher.state_file_path().await
    }

    /// Snapshot of the loaded sub-service set, in orchestration order.
    pub fn services(&self) -> Vec<Arc<SubService>> {
        self.services.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn services_at_level(&self, level: i32) -> Vec<Arc<SubService>> {
        self.services()
            .into_iter()
            .filter(|s| s.manifest.level == level && s.manifest.os.matches_host())
            .collect()
    }

    fn records(&self) -> Vec<StateRecord> {
        self.services()
            .iter()
            .map(|s| {
                let (st, info) = s.state_snapshot();
                StateRecord {
                    name: s.name().to_string(),
                    state: st.to_string(),
                    info: state::truncate_info(&info),
                }
            })
            .collect()
    }

    fn load_manifests(&self) -> anyhow::Result<()> {
        let set = manifest::load_folder(&self.settings.folder, &self.settings.ext)?;
        let levels = set.levels();
        let has_watch = set.active.iter().any(|m| !m.watch.is_empty());
        let loaded: Vec<Arc<SubService>> = set
            .active
            .into_iter()
            .map(|m| Arc::new(SubService::new(m, self.publish_tx.clone())))
            .collect();
        agl_event(
            "supervisor",
            None,
            format!(
                "manifests_loaded active={} disabled={} levels={levels:?}",
                loaded.len(),
                set.disabled.len()
            ),
        );
        *self.services.lock().unwrap_or_else(|p| p.into_inner()) = loaded;
        *self.levels.lock().unwrap_or_else(|p| p.into_inner()) = levels;
        self.has_watch.store(has_watch, Ordering::SeqCst);
        Ok(())
    }

    /// Start everything, level by level. Idempotent: a second Start while
    /// active is a no-op. A failure leaves already-started levels running;
    /// the caller decides whether to Stop.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            agl_event("supervisor", None, "start outcome=noop reason=already_started");
            return Ok(());
        }
        self.publisher.enable().await;

        let path = self.publisher.state_file_path().await;
        if let Some(fallback) = state::prepare_state_file(&path)? {
            self.publisher.set_state_file_path(fallback.clone()).await;
            anyhow::bail!(
                "state file {} exists but is not ours; refusing to delete it (state moved to {})",
                path.display(),
                fallback.display()
            );
        }

        if self.services().is_empty() {
            self.load_manifests()?;
        }

        let levels = self.levels.lock().unwrap_or_else(|p| p.into_inner()).clone();
        for level in levels {
            let mut waiting: Vec<Arc<SubService>> = Vec::new();
            for svc in self.services_at_level(level) {
                let actions =
                    effective_actions(&svc.manifest.start, &svc.manifest.run, ActionContext::Start);
                for raw in actions {
                    self.run_action(&svc, &raw, ActionContext::Start, Some(&mut waiting))
                        .await
                        .with_context(|| {
                            format!("start action {raw:?} of service {}", svc.name())
                        })?;
                }
                if !svc.manifest.watch.is_empty() {
                    svc.schedule_next_watch();
                }
            }
            self.wait_level_running(level, &waiting).await?;
            agl_event("supervisor", None, format!("level={level} outcome=started"));
        }

        if self.has_watch.load(Ordering::SeqCst) {
            self.start_watchdog();
        }
        let _ = self.publish_tx.send(());
        agl_event("supervisor", None, "start outcome=ok");
        Ok(())
    }

    /// Barrier: every monitored start of this level must reach Running
    /// before the next level begins. The budget is shared across the level.
    async fn wait_level_running(
        &self,
        level: i32,
        waiting: &[Arc<SubService>],
    ) -> anyhow::Result<()> {
        if waiting.is_empty() || self.settings.start_timeout_sec == 0 {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_secs(self.settings.start_timeout_sec);
        loop {
            let pending: Vec<&str> = waiting
                .iter()
                .filter(|s| s.state_snapshot().0 != ServiceState::Running)
                .map(|s| s.name())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "level {level}: not Running after {}s: {}",
                    self.settings.start_timeout_sec,
                    pending.join(", ")
                );
            }
            tokio::time::sleep(BARRIER_POLL).await;
        }
    }

    /// Stop everything in reverse level order. Per-action errors are
    /// collected, not fatal. Idempotent: Stop after Stop is a no-op.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            agl_event("supervisor", None, "stop outcome=noop reason=not_started");
            return Ok(());
        }

        let mut errors: Vec<String> = Vec::new();
        let levels = self.levels.lock().unwrap_or_else(|p| p.into_inner()).clone();
        for level in levels.into_iter().rev() {
            for svc in self.services_at_level(level) {
                let actions =
                    effective_actions(&svc.manifest.stop, &svc.manifest.run, ActionContext::Stop);
                for raw in actions {
                    if let Err(e) = self.run_action(&svc, &raw, ActionContext::Stop, None).await {
                        agl_event(
                            "stop",
                            Some(svc.name()),
                            format!("action={raw:?} outcome=error err={e:#}"),
                        );
                        errors.push(format!("{}: {e:#}", svc.name()));
                    }
                }
            }
            agl_event("supervisor", None, format!("level={level} outcome=stopped"));
        }

        let message = errors.join("; ");
        for svc in self.services() {
            svc.set_state(ServiceState::Stopped, message.clone());
        }

        // The HTML view survives, marked all-stopped; the binary file goes.
        let records = self.records();
        self.publisher.write_html(&records).await;
        self.publisher.delete_state_file().await;
        agl_event(
            "supervisor",
            None,
            format!("stop outcome=ok errors={} tasks_active={}", errors.len(), tasks().active_count()),
        );
        Ok(())
    }

    /// Release every Paused runner for an immediate retry.
    pub fn resume(&self) {
        for svc in self.services() {
            if svc.state_snapshot().0 != ServiceState::Paused {
                continue;
            }
            if let Some(h) = svc.runner_handle() {
                agl_event("resume", Some(svc.name()), "outcome=retry_signaled");
                h.signal(RunnerSignal::Retry);
            }
        }
    }

    // ---------------- Watchdog ----------------

    fn start_watchdog(self: &Arc<Self>) {
        if self.watchdog_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let sup = Arc::clone(self);
        tasks().spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if !sup.active.load(Ordering::SeqCst) {
                    break;
                }
                sup.watch_tick().await;
            }
            sup.watchdog_running.store(false, Ordering::SeqCst);
        });
    }

    /// One pass over all due watch schedules. Serial on purpose: slow watch
    /// work may delay other services past their `WatchDelaySec`.
    async fn watch_tick(&self) {
        let now = now_ms();
        for svc in self.services() {
            let due = svc.next_watch_ms();
            if due == 0 || now < due {
                continue;
            }
            if svc.runner_attached() {
                // The Runner maintains this service's state; don't probe over it.
                svc.schedule_next_watch();
                continue;
            }
            for raw in svc.manifest.watch.clone() {
                svc.set_state(ServiceState::ErrorRetrievingState, "");
                if let Err(e) = self.run_action(&svc, &raw, ActionContext::Watch, None).await {
                    agl_event(
                        "watch",
                        Some(svc.name()),
                        format!("action={raw:?} outcome=error err={e:#}"),
                    );
                    svc.set_state(ServiceState::Failed, format!("{e:#}"));
                }
            }
            svc.schedule_next_watch();
        }
    }

    // ---------------- Action execution ----------------

    /// Parse and run one action string. The verb list is a chain of
    /// alternatives: execution stops at the first verb reporting success.
    async fn run_action(
        &self,
        svc: &Arc<SubService>,
        raw: &str,
        ctx: ActionContext,
        mut waiting: Option<&mut Vec<Arc<SubService>>>,
    ) -> anyhow::Result<()> {
        let action = action::parse(raw, ctx);
        let param_raw = if action.param.is_empty() {
            svc.manifest.run.clone()
        } else {
            action.param.clone()
        };
        let param = expand(&self.settings, Some(&svc.manifest), &param_raw)?;

        for verb in &action.verbs {
            if self
                .exec_verb(svc, *verb, &param, &action, ctx, waiting.as_deref_mut())
                .await?
            {
                break;
            }
        }
        Ok(())
    }

    async fn exec_verb(
        &self,
        svc: &Arc<SubService>,
        verb: Verb,
        param: &str,
        action: &Action,
        ctx: ActionContext,
        waiting: Option<&mut Vec<Arc<SubService>>>,
    ) -> anyhow::Result<bool> {
        match verb {
            Verb::Exec => self.verb_exec(svc, param, ctx).await,
            Verb::Wait => self.verb_wait(svc, param, action.expected_status(), ctx).await,
            Verb::Http | Verb::Https => {
                self.verb_http(svc, verb, param, action.expected_http_status(), ctx)
                    .await
            }
            Verb::Sleep => verb_sleep(param).await,
            Verb::Start => self.verb_start(svc, param, waiting).map(|_| true),
            Verb::Stop => self.verb_stop(svc, param).await.map(|_| true),
            Verb::Service => self.verb_service(svc, param, ctx).await,
        }
    }

    /// `exec`: spawn-and-forget through the shell.
    async fn verb_exec(
        &self,
        svc: &Arc<SubService>,
        param: &str,
        ctx: ActionContext,
    ) -> anyhow::Result<bool> {
        let mut cmd = shell_command(param);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        match cmd.spawn() {
            Ok(_) => Ok(true),
            Err(e) => {
                let reason = format!("exec {param:?} failed: {e}");
                if ctx == ActionContext::Watch {
                    svc.set_state(ServiceState::Failed, reason);
                    Ok(false)
                } else {
                    anyhow::bail!(reason)
                }
            }
        }
    }

    /// `wait`: run through the shell and compare the exit status.
    async fn verb_wait(
        &self,
        svc: &Arc<SubService>,
        param: &str,
        expected: i32,
        ctx: ActionContext,
    ) -> anyhow::Result<bool> {
        let mut cmd = shell_command(param);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let status = match cmd.status().await {
            Ok(st) => st,
            Err(e) => {
                let reason = format!("wait {param:?} failed: {e}");
                if ctx == ActionContext::Watch {
                    svc.set_state(ServiceState::Failed, reason);
                    return Ok(false);
                }
                anyhow::bail!(reason)
            }
        };
        let code = status.code().unwrap_or(-1);
        if code == expected {
            if ctx == ActionContext::Watch {
                svc.set_state(ServiceState::Running, format!("ExitCode={code}"));
            }
            return Ok(true);
        }
        let reason = format!("command {param:?} returned {code} but expected {expected}");
        if ctx == ActionContext::Watch {
            svc.set_state(ServiceState::Failed, reason);
            return Ok(false);
        }
        anyhow::bail!(reason)
    }

    /// `http`/`https`: GET probe with the shared timeout.
    async fn verb_http(
        &self,
        svc: &Arc<SubService>,
        verb: Verb,
        param: &str,
        expected: i32,
        ctx: ActionContext,
    ) -> anyhow::Result<bool> {
        let url = format!("{}:{}", verb.as_str(), param);
        match self.http.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16() as i32;
                if status == expected {
                    if ctx == ActionContext::Watch {
                        svc.set_state(ServiceState::Running, format!("HTTP {status}"));
                    }
                    return Ok(true);
                }
                let reason = format!("http returned {status} but expected {expected}");
                if ctx == ActionContext::Watch {
                    svc.set_state(ServiceState::Failed, reason);
                    return Ok(false);
                }
                anyhow::bail!(reason)
            }
            Err(e) => {
                let reason = format!("http request {url:?} failed: {e}");
                if ctx == ActionContext::Watch {
                    svc.set_state(ServiceState::Failed, reason);
                    return Ok(false);
                }
                anyhow::bail!(reason)
            }
        }
    }

    /// `start`: create the monitored Runner. At most one per sub-service.
    fn verb_start(
        &self,
        svc: &Arc<SubService>,
        param: &str,
        waiting: Option<&mut Vec<Arc<SubService>>>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            svc.started().is_empty(),
            "service {}: only a single start is allowed",
            svc.name()
        );

        let redirect = if svc.manifest.redirect_log_file.is_empty() {
            None
        } else {
            let path = PathBuf::from(expand(
                &self.settings,
                Some(&svc.manifest),
                &svc.manifest.redirect_log_file,
            )?);
            ensure_file_exists(&path)?;
            Some(RedirectConfig {
                path,
                rotate_files: svc.manifest.redirect_log_rotate_files,
                rotate_bytes: svc.manifest.redirect_log_rotate_bytes,
            })
        };

        let mut env: Vec<(String, String)> = Vec::with_capacity(svc.manifest.start_env.len());
        for entry in &svc.manifest.start_env {
            let expanded = expand(&self.settings, Some(&svc.manifest), entry)?;
            let (k, v) = expanded
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("StartEnv entry {entry:?} expanded to {expanded:?} without '='"))?;
            env.push((k.to_string(), v.to_string()));
        }

        let work_dir = if svc.manifest.start_work_dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(expand(
                &self.settings,
                Some(&svc.manifest),
                &svc.manifest.start_work_dir,
            )?))
        };

        let cfg = RunnerConfig {
            name: svc.name().to_string(),
            command: param.to_string(),
            env,
            replace_env: svc.manifest.replace_env(),
            work_dir,
            redirect,
            retry_stable_sec: svc.manifest.retry_stable_sec,
            abort_exit_codes: svc.manifest.abort_exit_codes.clone(),
            stop_timeout: Duration::from_secs(svc.manifest.stop_run_abort_timeout_sec),
        };
        runner::launch(cfg, svc);
        if let Some(w) = waiting {
            w.push(Arc::clone(svc));
        }
        svc.set_started(param);
        Ok(())
    }

    /// `stop`: abort the monitored Runner and wait (bounded) for it to end.
    async fn verb_stop(&self, svc: &Arc<SubService>, param: &str) -> anyhow::Result<()> {
        let started = svc.started();
        if started.is_empty() {
            return Ok(());
        }
        anyhow::ensure!(
            param == started,
            "service {}: stop parameter {param:?} does not match the in-flight start {started:?}",
            svc.name()
        );

        let Some(handle) = svc.runner_handle() else {
            agl_event("stop", Some(svc.name()), "outcome=nothing_running");
            svc.clear_started();
            return Ok(());
        };

        handle.signal(RunnerSignal::Abort);
        svc.set_state(ServiceState::Stopping, "");

        let budget = Duration::from_secs(svc.manifest.stop_run_abort_timeout_sec)
            .saturating_mul(3)
            .max(Duration::from_secs(1));
        let deadline = Instant::now() + budget;
        while svc.runner_attached() {
            if Instant::now() >= deadline {
                agl_event(
                    "stop",
                    Some(svc.name()),
                    format!("outcome=runner_still_alive waited_ms={}", budget.as_millis()),
                );
                break;
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        svc.clear_started();
        Ok(())
    }

    /// `service`: OS service control, Windows only.
    #[cfg(target_os = "windows")]
    async fn verb_service(
        &self,
        svc: &Arc<SubService>,
        name: &str,
        ctx: ActionContext,
    ) -> anyhow::Result<bool> {
        use tokio::process::Command;
        let sub = match ctx {
            ActionContext::Start => Some("start"),
            ActionContext::Stop => Some("stop"),
            ActionContext::Watch => None,
        };
        if let Some(sub) = sub {
            let _ = Command::new("sc").args([sub, name]).output().await;
        }
        let out = Command::new("sc")
            .args(["query", name])
            .output()
            .await
            .with_context(|| format!("query service {name}"))?;
        let text = String::from_utf8_lossy(&out.stdout);
        let state_line = text
            .lines()
            .find(|l| l.trim_start().starts_with("STATE"))
            .unwrap_or("");
        let state = if state_line.contains("RUNNING") {
            ServiceState::Running
        } else if state_line.contains("START_PENDING") {
            ServiceState::Starting
        } else if state_line.contains("STOP_PENDING") {
            ServiceState::Stopping
        } else if state_line.contains("STOPPED") {
            ServiceState::Stopped
        } else {
            ServiceState::ErrorRetrievingState
        };
        svc.set_state(state, format!("service {name}"));
        Ok(true)
    }

    // The parser never admits `service` off Windows; this arm only exists so
    // the dispatch is total.
    #[cfg(not(target_os = "windows"))]
    async fn verb_service(
        &self,
        _svc: &Arc<SubService>,
        _name: &str,
        _ctx: ActionContext,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// `sleep`: block for the given milliseconds; an unparseable parameter is a
/// non-success verb, not an error.
async fn verb_sleep(param: &str) -> anyhow::Result<bool> {
    match param.trim().parse::<u64>() {
        Ok(ms) => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

fn shell_command(param: &str) -> tokio::process::Command {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/C");
        c
    } else {
        let mut c = tokio::process::Command::new("sh");
        c.arg("-c");
        c
    };
    cmd.arg(param);
    cmd
}

/// An empty action list means `["<phase>:%run%"]` when `run` is non-empty.
fn effective_actions(explicit: &[String], run: &str, ctx: ActionContext) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    if run.trim().is_empty() {
        return Vec::new();
    }
    vec![format!("{ctx}:%run%")]
}

fn ensure_file_exists(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create redirect dir {}", parent.display()))?;
        }
    }
    std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("open redirect file {}", path.display()))?;
    Ok(())
}

fn spawn_publish_task(
    publisher: Arc<StatePublisher>,
    services: Arc<Mutex<Vec<Arc<SubService>>>>,
    mut rx: mpsc::UnboundedReceiver<()>,
) {
    tasks().spawn(async move {
        while rx.recv().await.is_some() {
            // Coalesce a burst of state changes into one write.
            while rx.try_recv().is_ok() {}
            let records: Vec<StateRecord> = {
                let g = services.lock().unwrap_or_else(|p| p.into_inner());
                g.iter()
                    .map(|s| {
                        let (st, info) = s.state_snapshot();
                        StateRecord {
                            name: s.name().to_string(),
                            state: st.to_string(),
                            info: state::truncate_info(&info),
                        }
                    })
                    .collect()
            };
            if let Err(e) = publisher.publish(&records).await {
                agl_event("state", None, format!("outcome=publish_error err={e:#}"));
            }
        }
    });
}

// ---------------- Daemon entry ----------------

pub fn run_daemon(settings: LauncherSettings) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run_daemon_async(settings))
}

pub async fn run_daemon_async(settings: LauncherSettings) -> anyhow::Result<()> {
    crate::agl::eventlog::start_log_file(&settings.log_path);
    agl_event("daemon", None, crate::agl::build_info::banner());

    let sup = Supervisor::new(Arc::new(settings))?;
    sup.start().await?;

    let pid_path = state::pid_file_path(&sup.state_file_path().await);
    if let Err(e) = std::fs::write(&pid_path, format!("{}\n", std::process::id())) {
        agl_event(
            "daemon",
            None,
            format!("outcome=pid_file_error path={} err={e}", pid_path.display()),
        );
    }

    wait_for_shutdown(&sup).await?;

    sup.stop().await?;
    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(sup: &Arc<Supervisor>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?;
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                agl_event("daemon", None, "signal=SIGTERM outcome=stopping");
                return Ok(());
            }
            _ = sigint.recv() => {
                agl_event("daemon", None, "signal=SIGINT outcome=stopping");
                return Ok(());
            }
            _ = sigusr1.recv() => {
                agl_event("daemon", None, "signal=SIGUSR1 outcome=resume");
                sup.resume();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_sup: &Arc<Supervisor>) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    agl_event("daemon", None, "signal=ctrl_c outcome=stopping");
    Ok(())
}
