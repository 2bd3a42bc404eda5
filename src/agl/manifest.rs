use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::agl::eventlog::agl_event;

const MAX_MANIFEST_BYTES: u64 = 1024 * 1024; // 1 MiB

// ---------------- Manifest fields and defaults ----------------

fn default_retry_stable_sec() -> u64 {
    60
}
fn default_stop_run_abort_timeout_sec() -> u64 {
    10
}
fn default_watch_delay_sec() -> u64 {
    60
}
fn default_rotate_bytes() -> u64 {
    100 * (1 << 20)
}

/// Target OS family of a manifest. A non-matching manifest is still loaded
/// but skipped at orchestration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OsFilter {
    #[default]
    Any,
    Windows,
    Linux,
    Macos,
}

impl OsFilter {
    pub fn matches_host(self) -> bool {
        match self {
            OsFilter::Any => true,
            OsFilter::Windows => cfg!(target_os = "windows"),
            OsFilter::Linux => cfg!(target_os = "linux"),
            OsFilter::Macos => cfg!(target_os = "macos"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartOption {
    #[serde(rename = "soReplaceEnv")]
    ReplaceEnv,
    #[serde(rename = "soWinJobCloseChildren")]
    WinJobCloseChildren,
}

/// One sub-service description, parsed from one manifest file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
pub struct Manifest {
    /// Unique id, compared case-insensitively across the manifest folder.
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Default parameter used when an action has no explicit `:param`.
    #[serde(default)]
    pub run: String,

    /// Ordering class: start ascending, stop descending. `<= 0` disables.
    pub level: i32,

    #[serde(default, rename = "OS")]
    pub os: OsFilter,

    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub watch: Vec<String>,

    /// `NAME=VALUE` entries applied to monitored starts.
    #[serde(default)]
    pub start_env: Vec<String>,

    #[serde(default)]
    pub start_options: Vec<StartOption>,

    #[serde(default)]
    pub start_work_dir: String,

    /// Graceful wait before a monitored child is hard-terminated.
    #[serde(default = "default_stop_run_abort_timeout_sec")]
    pub stop_run_abort_timeout_sec: u64,

    /// A run shorter than this is "unstable" and pauses before restarting;
    /// 0 disables auto-restart entirely.
    #[serde(default = "default_retry_stable_sec")]
    pub retry_stable_sec: u64,

    /// Exit codes that suppress auto-restart (park until abort or retry).
    #[serde(default)]
    pub abort_exit_codes: Vec<i32>,

    #[serde(default = "default_watch_delay_sec")]
    pub watch_delay_sec: u64,

    /// Console-output capture file template (placeholders allowed).
    /// Empty disables capture.
    #[serde(default)]
    pub redirect_log_file: String,

    /// Rotation count including the current file; 0 disables rotation.
    #[serde(default)]
    pub redirect_log_rotate_files: usize,

    #[serde(default = "default_rotate_bytes")]
    pub redirect_log_rotate_bytes: u64,

    #[serde(skip)]
    pub source_file: Option<PathBuf>,
}

impl Manifest {
    pub fn replace_env(&self) -> bool {
        self.start_options.contains(&StartOption::ReplaceEnv)
    }

    pub fn win_job_close_children(&self) -> bool {
        self.start_options.contains(&StartOption::WinJobCloseChildren)
    }

    /// Name-based field lookup for `%<field>%` placeholders inside action
    /// strings. Matched case-insensitively; returns only scalar fields.
    pub fn field(&self, name: &str) -> Option<String> {
        match name.to_ascii_lowercase().as_str() {
            "name" => Some(self.name.clone()),
            "description" => Some(self.description.clone()),
            "run" => Some(self.run.clone()),
            "level" => Some(self.level.to_string()),
            "startworkdir" => Some(self.start_work_dir.clone()),
            "redirectlogfile" => Some(self.redirect_log_file.clone()),
            "retrystablesec" => Some(self.retry_stable_sec.to_string()),
            "watchdelaysec" => Some(self.watch_delay_sec.to_string()),
            "stoprunaborttimeoutsec" => Some(self.stop_run_abort_timeout_sec.to_string()),
            _ => None,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.name.trim().is_empty(), "Name must not be empty");
        anyhow::ensure!(
            self.name.trim() == self.name,
            "Name must not have leading/trailing whitespace: {:?}",
            self.name
        );
        for e in &self.start_env {
            anyhow::ensure!(
                e.contains('=') && !e.starts_with('='),
                "StartEnv entry must be NAME=VALUE: {e:?}"
            );
        }
        Ok(())
    }
}

pub fn parse_manifest_yaml(raw: &str, source_file: &Path) -> anyhow::Result<Manifest> {
    let mut m: Manifest = serde_yaml::from_str(raw)
        .map_err(|e| anyhow::anyhow!("failed to parse manifest {}: {e}", source_file.display()))?;
    m.validate()
        .with_context(|| format!("invalid manifest {}", source_file.display()))?;
    m.source_file = Some(source_file.to_path_buf());
    Ok(m)
}

pub fn load_manifest(path: &Path) -> anyhow::Result<Manifest> {
    if let Ok(md) = std::fs::metadata(path) {
        anyhow::ensure!(
            md.len() <= MAX_MANIFEST_BYTES,
            "manifest {} too large ({} bytes > {} bytes limit)",
            path.display(),
            md.len(),
            MAX_MANIFEST_BYTES
        );
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read manifest {}: {e}", path.display()))?;
    parse_manifest_yaml(&raw, path)
}

/// The manifest folder, loaded: active entries sorted for orchestration plus
/// the disabled ones (level <= 0), which stay visible to `settings` output.
#[derive(Debug, Default)]
pub struct ManifestSet {
    pub active: Vec<Manifest>,
    pub disabled: Vec<Manifest>,
}

impl ManifestSet {
    /// Distinct levels of the active set, ascending.
    pub fn levels(&self) -> Vec<i32> {
        let mut levels: Vec<i32> = self.active.iter().map(|m| m.level).collect();
        levels.sort_unstable();
        levels.dedup();
        levels
    }
}

/// Enumerate `folder/*<ext>`, parse every manifest, reject duplicate names
/// (case-insensitive) as a configuration error naming both files.
pub fn load_folder(folder: &Path, ext: &str) -> anyhow::Result<ManifestSet> {
    let entries = std::fs::read_dir(folder)
        .map_err(|e| anyhow::anyhow!("failed to read manifest folder {}: {e}", folder.display()))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .map(|n| n.to_string_lossy().to_lowercase().ends_with(&ext.to_lowercase()))
                    .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut set = ManifestSet::default();
    let mut seen: Vec<(String, PathBuf)> = Vec::new(); // canonical name -> file
    for path in paths {
        let m = load_manifest(&path)?;
        let canon = m.name.trim().to_ascii_lowercase();
        if let Some((_, prev)) = seen.iter().find(|(n, _)| *n == canon) {
            anyhow::bail!(
                "duplicate sub-service name (case-insensitive) {:?} in {} and {}",
                m.name,
                prev.display(),
                path.display()
            );
        }
        seen.push((canon, path.clone()));
        if m.level <= 0 {
            agl_event(
                "manifest",
                Some(&m.name),
                format!("outcome=disabled level={} file={}", m.level, path.display()),
            );
            set.disabled.push(m);
        } else {
            set.active.push(m);
        }
    }

    // (level asc, case-insensitive name asc): the orchestration order.
    set.active
        .sort_by(|a, b| (a.level, a.name.to_ascii_lowercase()).cmp(&(b.level, b.name.to_ascii_lowercase())));
    Ok(set)
}

/// Render a full manifest for the `new` verb using canonical defaults, so a
/// freshly scaffolded file documents every knob.
pub fn render_new_manifest(name: &str, exe: &str, params: &[String]) -> anyhow::Result<String> {
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct NewManifest {
        name: String,
        description: String,
        run: String,
        level: i32,
        #[serde(rename = "OS")]
        os: OsFilter,
        start: Vec<String>,
        stop: Vec<String>,
        watch: Vec<String>,
        start_env: Vec<String>,
        start_work_dir: String,
        stop_run_abort_timeout_sec: u64,
        retry_stable_sec: u64,
        abort_exit_codes: Vec<i32>,
        watch_delay_sec: u64,
        redirect_log_file: String,
        redirect_log_rotate_files: usize,
        redirect_log_rotate_bytes: u64,
    }

    let mut run = exe.to_string();
    if !params.is_empty() {
        run.push(' ');
        run.push_str(&params.join(" "));
    }

    let out = NewManifest {
        name: name.to_string(),
        description: String::new(),
        run,
        level: 100,
        os: OsFilter::Any,
        start: vec![],
        stop: vec![],
        watch: vec![],
        start_env: vec![],
        start_work_dir: String::new(),
        stop_run_abort_timeout_sec: default_stop_run_abort_timeout_sec(),
        retry_stable_sec: default_retry_stable_sec(),
        abort_exit_codes: vec![],
        watch_delay_sec: default_watch_delay_sec(),
        redirect_log_file: String::new(),
        redirect_log_rotate_files: 0,
        redirect_log_rotate_bytes: default_rotate_bytes(),
    };

    serde_yaml::to_string(&out).map_err(|e| anyhow::anyhow!("failed to render manifest: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_manifest_gets_defaults() {
        let raw = "Name: web\nLevel: 10\nRun: /usr/bin/web --serve\n";
        let m = parse_manifest_yaml(raw, Path::new("web.yml")).expect("parse");
        assert_eq!(m.name, "web");
        assert_eq!(m.level, 10);
        assert_eq!(m.retry_stable_sec, 60);
        assert_eq!(m.stop_run_abort_timeout_sec, 10);
        assert_eq!(m.watch_delay_sec, 60);
        assert_eq!(m.redirect_log_rotate_files, 0);
        assert_eq!(m.redirect_log_rotate_bytes, 100 * (1 << 20));
        assert_eq!(m.os, OsFilter::Any);
        assert!(m.start.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = "Name: web\nLevel: 10\nBogus: 1\n";
        assert!(parse_manifest_yaml(raw, Path::new("web.yml")).is_err());
    }

    #[test]
    fn start_env_must_be_name_value() {
        let raw = "Name: web\nLevel: 10\nStartEnv: [\"NOEQUALS\"]\n";
        assert!(parse_manifest_yaml(raw, Path::new("web.yml")).is_err());
        let raw = "Name: web\nLevel: 10\nStartEnv: [\"PORT=8080\"]\n";
        assert!(parse_manifest_yaml(raw, Path::new("web.yml")).is_ok());
    }

    #[test]
    fn start_options_parse() {
        let raw = "Name: web\nLevel: 10\nStartOptions: [soReplaceEnv, soWinJobCloseChildren]\n";
        let m = parse_manifest_yaml(raw, Path::new("web.yml")).expect("parse");
        assert!(m.replace_env());
        assert!(m.win_job_close_children());
    }

    #[test]
    fn duplicate_names_fail_naming_both_files() {
        let dir = tempfile::tempdir().expect("tmpdir");
        std::fs::write(dir.path().join("a.yml"), "Name: Web\nLevel: 10\n").unwrap();
        std::fs::write(dir.path().join("b.yml"), "Name: web\nLevel: 20\n").unwrap();
        let err = load_folder(dir.path(), ".yml").unwrap_err().to_string();
        assert!(err.contains("duplicate"), "{err}");
        assert!(err.contains("a.yml") && err.contains("b.yml"), "{err}");
    }

    #[test]
    fn disabled_levels_are_kept_out_of_the_active_set() {
        let dir = tempfile::tempdir().expect("tmpdir");
        std::fs::write(dir.path().join("a.yml"), "Name: a\nLevel: 0\n").unwrap();
        std::fs::write(dir.path().join("b.yml"), "Name: b\nLevel: 10\n").unwrap();
        let set = load_folder(dir.path(), ".yml").expect("load");
        assert_eq!(set.active.len(), 1);
        assert_eq!(set.disabled.len(), 1);
        assert_eq!(set.levels(), vec![10]);
    }

    #[test]
    fn active_set_sorts_by_level_then_name() {
        let dir = tempfile::tempdir().expect("tmpdir");
        std::fs::write(dir.path().join("1.yml"), "Name: Zeta\nLevel: 10\n").unwrap();
        std::fs::write(dir.path().join("2.yml"), "Name: alpha\nLevel: 20\n").unwrap();
        std::fs::write(dir.path().join("3.yml"), "Name: beta\nLevel: 10\n").unwrap();
        let set = load_folder(dir.path(), ".yml").expect("load");
        let names: Vec<&str> = set.active.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["beta", "Zeta", "alpha"]);
    }

    #[test]
    fn rendered_new_manifest_round_trips() {
        let raw =
            render_new_manifest("web", "/usr/bin/web", &["--serve".to_string()]).expect("render");
        let m = parse_manifest_yaml(&raw, Path::new("web.yml")).expect("parse");
        assert_eq!(m.name, "web");
        assert_eq!(m.run, "/usr/bin/web --serve");
        assert_eq!(m.level, 100);
    }
}
