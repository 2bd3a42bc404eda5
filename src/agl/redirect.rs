use anyhow::Context as _;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::agl::eventlog::agl_event;

/// Open a log file for appending, creating it (and its parent directory) if missing.
pub(crate) async fn open_append(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
    }
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await
        .with_context(|| format!("open log file {}", path.display()))
}

/// Numbered rotation: `base` -> `base.1`, shifting existing backups up by one.
///
/// `files` counts the current file too, so `files` of N keeps at most N-1
/// numbered backups and no suffix ever reaches N. `files <= 1` keeps no
/// backups: the current file is simply discarded and recreated.
pub(crate) async fn rotate_numbered(base: &Path, files: usize) -> anyhow::Result<()> {
    if files <= 1 {
        if tokio::fs::metadata(base).await.is_ok() {
            let _ = tokio::fs::remove_file(base).await;
        }
        return Ok(());
    }

    // Delete the oldest backup first.
    let oldest = PathBuf::from(format!("{}.{}", base.display(), files - 1));
    if tokio::fs::metadata(&oldest).await.is_ok() {
        let _ = tokio::fs::remove_file(&oldest).await;
    }

    // Shift: (files-2 ..= 1)
    for i in (1..files - 1).rev() {
        let from = PathBuf::from(format!("{}.{}", base.display(), i));
        let to = PathBuf::from(format!("{}.{}", base.display(), i + 1));
        if tokio::fs::metadata(&from).await.is_ok() {
            let _ = tokio::fs::rename(&from, &to).await;
        }
    }

    // Move base -> base.1
    let to1 = PathBuf::from(format!("{}.1", base.display()));
    if tokio::fs::metadata(base).await.is_ok() {
        let _ = tokio::fs::rename(base, &to1).await;
    }
    Ok(())
}

/// Console-output sink of a monitored sub-service.
///
/// Bytes are copied verbatim into the redirect file. When size rotation is
/// enabled and a chunk would push the file past the threshold, the chunk is
/// split at its last line terminator so that the rotated file never ends
/// mid-line; the remainder starts the fresh file.
///
/// A write error permanently closes the sink (the child keeps running and its
/// further output is dropped).
#[derive(Debug)]
pub struct RedirectWriter {
    service: String,
    path: PathBuf,
    file: Option<File>,
    size: u64,
    rotate_files: usize,
    rotate_bytes: u64,
}

impl RedirectWriter {
    pub async fn open(
        service: &str,
        path: PathBuf,
        rotate_files: usize,
        rotate_bytes: u64,
    ) -> anyhow::Result<Self> {
        let file = open_append(&path).await?;
        let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            service: service.to_string(),
            path,
            file: Some(file),
            size,
            rotate_files,
            rotate_bytes,
        })
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Write one chunk of console output. Never fails: an I/O error closes
    /// the sink and logs a warning instead.
    pub async fn write_chunk(&mut self, chunk: &[u8]) {
        if self.file.is_none() || chunk.is_empty() {
            return;
        }
        if let Err(e) = self.write_inner(chunk).await {
            agl_event(
                "redirect",
                Some(&self.service),
                format!("outcome=write_error path={} err={e:#}", self.path.display()),
            );
            self.file = None;
        }
    }

    pub async fn flush(&mut self) {
        if let Some(f) = self.file.as_mut() {
            let _ = f.flush().await;
        }
    }

    async fn write_inner(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        let rotation_due = self.rotate_files > 0
            && self.rotate_bytes > 0
            && self.size + chunk.len() as u64 > self.rotate_bytes;
        if rotation_due {
            // Split at the last LF/CR so the rotated file ends on a line
            // boundary. A chunk with no terminator at all is written whole;
            // a later chunk will trigger the rotation.
            if let Some(cut) = chunk.iter().rposition(|b| *b == b'\n' || *b == b'\r') {
                self.write_all(&chunk[..=cut]).await?;
                self.rotate().await?;
                let rest = &chunk[cut + 1..];
                if !rest.is_empty() {
                    self.write_all(rest).await?;
                }
                return Ok(());
            }
        }
        self.write_all(chunk).await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let f = self.file.as_mut().expect("redirect file open");
        f.write_all(bytes).await?;
        self.size = self.size.saturating_add(bytes.len() as u64);
        Ok(())
    }

    async fn rotate(&mut self) -> anyhow::Result<()> {
        if let Some(mut f) = self.file.take() {
            let _ = f.flush().await;
        }
        rotate_numbered(&self.path, self.rotate_files).await?;
        self.file = Some(open_append(&self.path).await?);
        self.size = 0;
        Ok(())
    }
}
