use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::agl::manifest;
use crate::agl::settings::LauncherSettings;
use crate::agl::state::{self, StateRecord};
use crate::agl::supervisor;

#[derive(Debug, Parser)]
#[command(name = "aglauncher", version, about = "declarative sub-service supervisor")]
pub struct Args {
    /// Directory holding sub-service manifests
    #[arg(short = 'f', long = "folder", default_value = "services.d")]
    pub folder: PathBuf,

    /// Manifest file extension
    #[arg(long = "ext", default_value = ".yml")]
    pub ext: String,

    /// Aggregate state file (binary, magic-prefixed)
    #[arg(long = "state-file", default_value = "aglauncher.state")]
    pub state_file: PathBuf,

    /// Identifier for the HTML state view; omitting it disables the view
    #[arg(long = "html-title")]
    pub html_title: Option<String>,

    /// Timeout for http/https probe requests (milliseconds)
    #[arg(long = "http-timeout-ms", default_value_t = 200)]
    pub http_timeout_ms: u64,

    /// Per-level budget for the wait-until-Running barrier; 0 disables
    #[arg(long = "start-timeout-sec", default_value_t = 30)]
    pub start_timeout_sec: u64,

    /// Directory for the supervisor log file; manifests see it as %log%
    #[arg(long = "log-path", default_value = "logs")]
    pub log_path: PathBuf,

    /// Extra parameters exposed to manifests as %agl.params%
    #[arg(long = "params", default_value = "")]
    pub params: String,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Print the current state table (read from the state file)
    List {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Load the manifest folder and report what would be supervised
    Settings,
    /// Write a new sub-service manifest with canonical defaults
    New {
        name: String,
        exe: String,
        params: Vec<String>,
    },
    /// Ask a running supervisor to retry all paused sub-services
    #[command(alias = "retry")]
    Resume,
    /// Print local build info
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Args {
    fn settings(&self) -> LauncherSettings {
        LauncherSettings {
            folder: self.folder.clone(),
            ext: self.ext.clone(),
            http_timeout_ms: self.http_timeout_ms,
            state_file: self.state_file.clone(),
            html_title: self.html_title.clone(),
            start_timeout_sec: self.start_timeout_sec,
            log_path: self.log_path.clone(),
            params: self.params.clone(),
            base_dir: LauncherSettings::exe_dir(),
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    if matches!(&args.cmd, Some(Cmd::Version)) {
        println!("{}", crate::agl::build_info::banner());
        return Ok(());
    }
    let settings = args.settings();

    match args.cmd {
        None => supervisor::run_daemon(settings),
        Some(Cmd::List { format }) => {
            let records = state::read_state_file(&settings.state_file)?;
            match format {
                OutputFormat::Text => println!("{}", render_state_table(&records)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
            }
            Ok(())
        }
        Some(Cmd::Settings) => {
            let set = manifest::load_folder(&settings.folder, &settings.ext)?;
            println!(
                "{} active, {} disabled sub-service(s) in {}",
                set.active.len(),
                set.disabled.len(),
                settings.folder.display()
            );
            for m in &set.active {
                println!("  level {:>4}  {}", m.level, m.name);
            }
            for m in &set.disabled {
                println!("  disabled   {}", m.name);
            }
            Ok(())
        }
        Some(Cmd::New { name, exe, params }) => {
            let path = settings.folder.join(format!("{name}{}", settings.ext));
            anyhow::ensure!(
                !path.exists(),
                "manifest {} already exists; refusing to overwrite",
                path.display()
            );
            let rendered = manifest::render_new_manifest(&name, &exe, &params)?;
            std::fs::create_dir_all(&settings.folder)?;
            std::fs::write(&path, rendered)?;
            println!("wrote {}", path.display());
            Ok(())
        }
        Some(Cmd::Resume) => send_resume(&settings),
        Some(Cmd::Version) => unreachable!("handled before settings"),
    }
}

#[cfg(unix)]
fn send_resume(settings: &LauncherSettings) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_path = state::pid_file_path(&settings.state_file);
    let raw = std::fs::read_to_string(&pid_path).map_err(|e| {
        anyhow::anyhow!(
            "no pid file at {} ({e}); is the supervisor running?",
            pid_path.display()
        )
    })?;
    let pid: i32 = raw
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid pid file {}: {e}", pid_path.display()))?;
    kill(Pid::from_raw(pid), Signal::SIGUSR1)
        .map_err(|e| anyhow::anyhow!("signal pid {pid}: {e}"))?;
    println!("resume signaled to pid {pid}");
    Ok(())
}

#[cfg(not(unix))]
fn send_resume(_settings: &LauncherSettings) -> anyhow::Result<()> {
    anyhow::bail!("resume is delivered via the OS service controller on this platform");
}

fn render_state_table(records: &[StateRecord]) -> String {
    if records.is_empty() {
        return "(no sub-services)".to_string();
    }

    fn pad(s: &str, width: usize) -> String {
        if s.len() >= width {
            return s.to_string();
        }
        let mut out = String::with_capacity(width);
        out.push_str(s);
        out.push_str(&" ".repeat(width - s.len()));
        out
    }

    fn border(widths: &[usize]) -> String {
        let mut out = String::new();
        out.push('+');
        for w in widths {
            // 1 leading + 1 trailing padding space per cell.
            out.push_str(&"-".repeat(*w + 2));
            out.push('+');
        }
        out
    }

    fn row_line(cols: &[&str], widths: &[usize]) -> String {
        let mut out = String::new();
        out.push('|');
        for (i, w) in widths.iter().enumerate() {
            out.push(' ');
            out.push_str(&pad(cols.get(i).copied().unwrap_or(""), *w));
            out.push(' ');
            out.push('|');
        }
        out
    }

    let headers = ["name", "state", "info"];
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for r in records {
        widths[0] = widths[0].max(r.name.len());
        widths[1] = widths[1].max(r.state.len());
        widths[2] = widths[2].max(r.info.len());
    }

    let mut out = String::new();
    out.push_str(&border(&widths));
    out.push('\n');
    out.push_str(&row_line(&headers, &widths));
    out.push('\n');
    out.push_str(&border(&widths));
    for r in records {
        out.push('\n');
        out.push_str(&row_line(
            &[r.name.as_str(), r.state.as_str(), r.info.as_str()],
            &widths,
        ));
    }
    out.push('\n');
    out.push_str(&border(&widths));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_table_renders_aligned_rows() {
        let records = vec![
            StateRecord {
                name: "db".to_string(),
                state: "RUNNING".to_string(),
                info: "PID=4711".to_string(),
            },
            StateRecord {
                name: "webfrontend".to_string(),
                state: "PAUSED".to_string(),
                info: "Wait 15 sec".to_string(),
            },
        ];
        let table = render_state_table(&records);
        assert!(table.contains("| db          | RUNNING |"), "{table}");
        assert!(table.contains("| webfrontend | PAUSED  |"), "{table}");
        assert!(table.starts_with('+'));
    }

    #[test]
    fn empty_state_table_has_a_placeholder() {
        assert_eq!(render_state_table(&[]), "(no sub-services)");
    }

    #[test]
    fn cli_parses_daemon_mode_defaults() {
        let args = Args::parse_from(["aglauncher"]);
        assert!(args.cmd.is_none());
        assert_eq!(args.ext, ".yml");
        assert_eq!(args.http_timeout_ms, 200);
        assert_eq!(args.start_timeout_sec, 30);
    }

    #[test]
    fn cli_parses_retry_alias() {
        let args = Args::parse_from(["aglauncher", "retry"]);
        assert!(matches!(args.cmd, Some(Cmd::Resume)));
    }
}
