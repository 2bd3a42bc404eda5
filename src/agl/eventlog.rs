use chrono::Local;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::agl::asyncutil::tasks;
use crate::agl::redirect::{open_append, rotate_numbered};

// Supervisor log file defaults (independent of per-service redirect logs).
const LAUNCHER_LOG_NAME: &str = "aglauncher";
const LAUNCHER_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const LAUNCHER_LOG_FILES: usize = 10;

static LOG_TX: OnceLock<mpsc::UnboundedSender<String>> = OnceLock::new();
static EARLY_LOG: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();
const EARLY_LOG_MAX_LINES: usize = 5000;

/// Emit one structured event line to stderr and to the supervisor log file.
///
/// Lines written before [`start_log_file`] runs are buffered and flushed into
/// the file once the writer task is up, so early misconfiguration warnings
/// are not lost.
pub fn agl_event(component: &str, service: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let line = match service {
        Some(s) => format!("{ts} [{component}] service={s} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");
    if let Some(tx) = LOG_TX.get() {
        let _ = tx.send(line);
    } else {
        let q = EARLY_LOG.get_or_init(|| Mutex::new(VecDeque::new()));
        let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
        g.push_back(line);
        while g.len() > EARLY_LOG_MAX_LINES {
            g.pop_front();
        }
    }
}

/// Start the supervisor log file writer: `<log_path>/aglauncher.log`,
/// size-rotated. Safe to call once per process; later calls are no-ops.
pub fn start_log_file(log_path: &Path) {
    let base_path = log_path.join(format!("{LAUNCHER_LOG_NAME}.log"));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if LOG_TX.set(tx).is_err() {
        return;
    }

    agl_event(
        "log",
        None,
        format!(
            "launcher_log_file path={} rotate=size max_bytes={} files={}",
            base_path.display(),
            LAUNCHER_LOG_MAX_BYTES,
            LAUNCHER_LOG_FILES
        ),
    );

    tasks().spawn(async move {
        let mut f = match open_append(&base_path).await {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "{} [log] failed to open launcher log file {} err={e}",
                    Local::now().format("%Y-%m-%d_%H:%M:%S%.3f"),
                    base_path.display()
                );
                return;
            }
        };

        // Flush early boot lines (including manifest parse warnings).
        if let Some(q) = EARLY_LOG.get() {
            // Do not hold the mutex guard across `.await`.
            let drained: Vec<String> = {
                let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
                g.drain(..).collect()
            };
            for line in drained {
                let mut s = line;
                if !s.ends_with('\n') {
                    s.push('\n');
                }
                let _ = f.write_all(s.as_bytes()).await;
            }
            let _ = f.flush().await;
        }

        let mut bytes_written: u64 = tokio::fs::metadata(&base_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        while let Some(line) = rx.recv().await {
            if bytes_written >= LAUNCHER_LOG_MAX_BYTES {
                let _ = f.flush().await;
                if rotate_numbered(&base_path, LAUNCHER_LOG_FILES).await.is_ok() {
                    if let Ok(nf) = open_append(&base_path).await {
                        f = nf;
                        bytes_written = 0;
                    }
                }
            }

            let mut s = line;
            if !s.ends_with('\n') {
                s.push('\n');
            }
            if f.write_all(s.as_bytes()).await.is_ok() {
                bytes_written = bytes_written.saturating_add(s.len() as u64);
            }
        }
    });
}
