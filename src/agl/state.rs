use anyhow::Context as _;
use askama::Template;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::io::Read as _;
use std::path::{Path, PathBuf};

use crate::agl::eventlog::agl_event;

/// First four bytes (little-endian) of a state file written by us. A file
/// with any other prefix is somebody else's and must never be deleted.
pub const STATE_MAGIC: u32 = 0x5131_E3A6;

const MAX_INFO_CHARS: usize = 80;
const MAX_STATE_FILE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub name: String,
    pub state: String,
    pub info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    services: Vec<StateRecord>,
}

/// Clip the info column to its published width, on a char boundary.
pub fn truncate_info(s: &str) -> String {
    if s.chars().count() <= MAX_INFO_CHARS {
        return s.to_string();
    }
    s.chars().take(MAX_INFO_CHARS).collect()
}

pub fn encode_snapshot(records: &[StateRecord]) -> anyhow::Result<Vec<u8>> {
    let doc = StateDocument {
        services: records.to_vec(),
    };
    let mut out = STATE_MAGIC.to_le_bytes().to_vec();
    out.extend(serde_json::to_vec(&doc).context("encode state snapshot")?);
    Ok(out)
}

pub fn decode_snapshot(bytes: &[u8]) -> anyhow::Result<Vec<StateRecord>> {
    anyhow::ensure!(bytes.len() >= 4, "state file too short");
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    anyhow::ensure!(
        magic == STATE_MAGIC,
        "state file has foreign magic {magic:#010x} (expected {STATE_MAGIC:#010x})"
    );
    let doc: StateDocument = serde_json::from_slice(&bytes[4..]).context("decode state snapshot")?;
    Ok(doc.services)
}

/// Read and decode a state file (the `list` verb).
pub fn read_state_file(path: &Path) -> anyhow::Result<Vec<StateRecord>> {
    let md = std::fs::metadata(path)
        .map_err(|e| anyhow::anyhow!("no state file at {} ({e}); is the supervisor running?", path.display()))?;
    anyhow::ensure!(
        md.len() <= MAX_STATE_FILE_BYTES,
        "state file {} too large ({} bytes)",
        path.display(),
        md.len()
    );
    let mut bytes = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .with_context(|| format!("read state file {}", path.display()))?;
    decode_snapshot(&bytes)
}

/// Validate the configured state-file location before the first write.
///
/// A leftover file with our magic is stale and deleted, so that the file,
/// once present again, is guaranteed to be ours. A file with a different
/// prefix may be user content: it is left in place, the supervisor is moved
/// to a fresh temp path, and the error propagates to abort startup.
pub fn prepare_state_file(path: &Path) -> anyhow::Result<Option<PathBuf>> {
    let mut f = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("probe state file {}", path.display())),
    };
    let mut prefix = [0u8; 4];
    let n = f.read(&mut prefix).with_context(|| format!("read state file {}", path.display()))?;
    drop(f);

    if n == 4 && u32::from_le_bytes(prefix) == STATE_MAGIC {
        std::fs::remove_file(path)
            .with_context(|| format!("delete stale state file {}", path.display()))?;
        return Ok(None);
    }

    let fallback = std::env::temp_dir().join(format!("aglauncher-{}.state", std::process::id()));
    Ok(Some(fallback))
}

pub fn html_file_path(state_file: &Path) -> PathBuf {
    let mut s = state_file.as_os_str().to_os_string();
    s.push(".html");
    PathBuf::from(s)
}

pub fn pid_file_path(state_file: &Path) -> PathBuf {
    let mut s = state_file.as_os_str().to_os_string();
    s.push(".pid");
    PathBuf::from(s)
}

#[derive(Template)]
#[template(path = "state.html")]
struct StateHtml<'a> {
    title: &'a str,
    generated: String,
    services: &'a [StateRecord],
}

/// Publishes the aggregate state: a magic-prefixed binary file rewritten
/// only when its content changes, plus the optional HTML view next to it.
#[derive(Debug)]
pub struct StatePublisher {
    inner: tokio::sync::Mutex<PublisherInner>,
}

#[derive(Debug)]
struct PublisherInner {
    path: PathBuf,
    html_title: Option<String>,
    last: Vec<u8>,
    // Set while the supervisor is stopped; a late publish tick must not
    // recreate the deleted state file.
    suspended: bool,
}

impl StatePublisher {
    pub fn new(path: PathBuf, html_title: Option<String>) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(PublisherInner {
                path,
                html_title,
                last: Vec::new(),
                suspended: false,
            }),
        }
    }

    pub async fn state_file_path(&self) -> PathBuf {
        self.inner.lock().await.path.clone()
    }

    pub async fn set_state_file_path(&self, path: PathBuf) {
        let mut g = self.inner.lock().await;
        g.path = path;
        g.last.clear();
    }

    /// Allow publishing again after a stop suspended it.
    pub async fn enable(&self) {
        self.inner.lock().await.suspended = false;
    }

    /// Write the snapshot if it differs from the last written bytes.
    pub async fn publish(&self, records: &[StateRecord]) -> anyhow::Result<()> {
        let bytes = encode_snapshot(records)?;
        let mut g = self.inner.lock().await;
        if g.suspended || bytes == g.last {
            return Ok(());
        }
        write_atomic(&g.path, &bytes).await?;
        g.last = bytes;
        if g.html_title.is_some() {
            drop(g);
            self.write_html(records).await;
        }
        Ok(())
    }

    /// Regenerate the HTML view (best-effort; failures are logged).
    pub async fn write_html(&self, records: &[StateRecord]) {
        let (path, title) = {
            let g = self.inner.lock().await;
            let Some(title) = g.html_title.clone() else { return };
            (html_file_path(&g.path), title)
        };
        let page = StateHtml {
            title: &title,
            generated: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            services: records,
        };
        let rendered = match page.render() {
            Ok(r) => r,
            Err(e) => {
                agl_event("state", None, format!("outcome=html_render_error err={e}"));
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, rendered).await {
            agl_event(
                "state",
                None,
                format!("outcome=html_write_error path={} err={e}", path.display()),
            );
        }
    }

    /// Remove the binary state file and suspend publishing (the HTML view,
    /// if any, remains).
    pub async fn delete_state_file(&self) {
        let mut g = self.inner.lock().await;
        g.suspended = true;
        let _ = tokio::fs::remove_file(&g.path).await;
        g.last.clear();
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("write state file {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename state file into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<StateRecord> {
        vec![
            StateRecord {
                name: "db".to_string(),
                state: "RUNNING".to_string(),
                info: "PID=4711".to_string(),
            },
            StateRecord {
                name: "web".to_string(),
                state: "PAUSED".to_string(),
                info: "Wait 15 sec".to_string(),
            },
        ]
    }

    #[test]
    fn snapshot_round_trips_through_magic_prefix() {
        let bytes = encode_snapshot(&records()).expect("encode");
        assert_eq!(&bytes[..4], &STATE_MAGIC.to_le_bytes());
        let back = decode_snapshot(&bytes).expect("decode");
        assert_eq!(back, records());
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let mut bytes = encode_snapshot(&records()).expect("encode");
        bytes[0] ^= 0xff;
        let err = decode_snapshot(&bytes).unwrap_err().to_string();
        assert!(err.contains("foreign magic"), "{err}");
    }

    #[test]
    fn info_truncates_to_80_chars() {
        let long: String = "x".repeat(200);
        assert_eq!(truncate_info(&long).chars().count(), 80);
        assert_eq!(truncate_info("short"), "short");
    }

    #[test]
    fn prepare_deletes_only_our_files() {
        let dir = tempfile::tempdir().expect("tmpdir");

        // Our stale file: deleted.
        let ours = dir.path().join("ours.state");
        std::fs::write(&ours, encode_snapshot(&[]).unwrap()).unwrap();
        assert_eq!(prepare_state_file(&ours).expect("prepare"), None);
        assert!(!ours.exists());

        // Foreign file: kept, and a fallback path is proposed.
        let theirs = dir.path().join("theirs.state");
        std::fs::write(&theirs, b"user data, hands off").unwrap();
        let fallback = prepare_state_file(&theirs).expect("prepare");
        assert!(fallback.is_some());
        assert!(theirs.exists());
    }

    #[test]
    fn missing_file_needs_no_preparation() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let p = dir.path().join("none.state");
        assert_eq!(prepare_state_file(&p).expect("prepare"), None);
    }

    #[tokio::test]
    async fn publish_writes_only_on_change() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("agl.state");
        let publisher = StatePublisher::new(path.clone(), None);

        publisher.publish(&records()).await.expect("publish");
        let first = std::fs::metadata(&path).unwrap().modified().unwrap();
        // Unchanged snapshot: no rewrite.
        std::thread::sleep(std::time::Duration::from_millis(20));
        publisher.publish(&records()).await.expect("publish");
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), first);

        let mut changed = records();
        changed[0].state = "STOPPED".to_string();
        publisher.publish(&changed).await.expect("publish");
        assert_eq!(read_state_file(&path).expect("read"), changed);
    }

    #[tokio::test]
    async fn html_view_is_written_next_to_the_state_file() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("agl.state");
        let publisher = StatePublisher::new(path.clone(), Some("node<1>".to_string()));
        publisher.publish(&records()).await.expect("publish");

        let html = std::fs::read_to_string(html_file_path(&path)).expect("html");
        assert!(html.contains("node&lt;1&gt;"), "identifier must be escaped");
        assert!(html.contains("RUNNING"));
        assert!(html.contains("db"));
    }
}
