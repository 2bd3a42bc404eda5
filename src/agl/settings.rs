use std::path::{Path, PathBuf};

/// Process-lifetime supervisor settings. Built once from the command line;
/// immutable afterwards. The state-file path is the one exception: when an
/// existing file turns out not to be ours, the supervisor switches to a fresh
/// temp path (see `state::prepare_state_file`).
#[derive(Debug, Clone)]
pub struct LauncherSettings {
    /// Directory holding sub-service manifests.
    pub folder: PathBuf,
    /// Manifest file extension, including the dot.
    pub ext: String,
    /// Timeout for `http`/`https` probe requests, in milliseconds.
    pub http_timeout_ms: u64,
    /// Aggregate state file (binary, magic-prefixed).
    pub state_file: PathBuf,
    /// When set, an HTML state view is written to `<state_file>.html` with
    /// this identifier in the header.
    pub html_title: Option<String>,
    /// Per-level budget for the wait-until-Running barrier. 0 disables waiting.
    pub start_timeout_sec: u64,
    /// Directory for the supervisor's own log file; `%log%` resolves here.
    pub log_path: PathBuf,
    /// Extra parameters exposed to manifests as `%agl.params%`.
    pub params: String,
    /// Directory of the supervisor executable; `%agl.base%` resolves here.
    pub base_dir: PathBuf,
}

impl LauncherSettings {
    /// Directory of the running executable, for `%agl.base%`.
    pub fn exe_dir() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Name-based field lookup for `%agl.<field>%` placeholders.
    ///
    /// The table is deliberately explicit: it documents the set of legal
    /// tokens and keeps it testable. Names are matched case-insensitively.
    pub fn field(&self, name: &str) -> Option<String> {
        match name.to_ascii_lowercase().as_str() {
            "folder" => Some(self.folder.display().to_string()),
            "ext" => Some(self.ext.clone()),
            "httptimeoutms" => Some(self.http_timeout_ms.to_string()),
            "statefile" => Some(self.state_file.display().to_string()),
            "htmltitle" => Some(self.html_title.clone().unwrap_or_default()),
            "starttimeoutsec" => Some(self.start_timeout_sec.to_string()),
            "logpath" => Some(self.log_path.display().to_string()),
            _ => None,
        }
    }
}

/// Resolve a well-known folder token (`CommonData`, `UserData`, `TempFolder`)
/// to the host's corresponding directory. `Log` is settings-backed and
/// resolved by the expander, not here.
pub fn known_folder(token: &str) -> Option<PathBuf> {
    match token.to_ascii_lowercase().as_str() {
        "commondata" => Some(common_data_dir()),
        "userdata" => dirs::data_dir(),
        "tempfolder" => Some(std::env::temp_dir()),
        _ => None,
    }
}

#[cfg(target_os = "windows")]
fn common_data_dir() -> PathBuf {
    std::env::var_os("ProgramData")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
}

#[cfg(target_os = "macos")]
fn common_data_dir() -> PathBuf {
    PathBuf::from("/Library/Application Support")
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn common_data_dir() -> PathBuf {
    PathBuf::from("/var/lib")
}
