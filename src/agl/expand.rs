use chrono::Local;

use crate::agl::manifest::Manifest;
use crate::agl::settings::{known_folder, LauncherSettings};

/// Placeholders may reference other placeholders; the replacement text is
/// itself expanded. This bound stops a self-referential manifest from
/// recursing forever.
const MAX_EXPAND_DEPTH: usize = 50;

/// Expand every `%TOKEN%` in `input`. `%%` collapses to a literal `%`.
/// An unknown token is a configuration error.
pub fn expand(
    settings: &LauncherSettings,
    manifest: Option<&Manifest>,
    input: &str,
) -> anyhow::Result<String> {
    expand_depth(settings, manifest, input, 0)
}

fn expand_depth(
    settings: &LauncherSettings,
    manifest: Option<&Manifest>,
    input: &str,
    depth: usize,
) -> anyhow::Result<String> {
    anyhow::ensure!(
        depth <= MAX_EXPAND_DEPTH,
        "placeholder recursion depth exceeded ({MAX_EXPAND_DEPTH}) while expanding {input:?}"
    );

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        let Some(start) = rest.find('%') else {
            out.push_str(rest);
            return Ok(out);
        };
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('%') else {
            anyhow::bail!("unterminated placeholder in {input:?}");
        };
        let token = &after[..end];
        if token.is_empty() {
            out.push('%');
        } else {
            let replacement = resolve(settings, manifest, token)?;
            out.push_str(&expand_depth(settings, manifest, &replacement, depth + 1)?);
        }
        rest = &after[end + 1..];
    }
}

fn resolve(
    settings: &LauncherSettings,
    manifest: Option<&Manifest>,
    token: &str,
) -> anyhow::Result<String> {
    let t = token.to_ascii_lowercase();

    if let Some(p) = known_folder(&t) {
        return Ok(p.display().to_string());
    }
    if t == "log" {
        return Ok(settings.log_path.display().to_string());
    }

    match t.as_str() {
        "agl.base" => return Ok(settings.base_dir.display().to_string()),
        "agl.now" => return Ok(Local::now().format("%Y%m%d_%H%M%S").to_string()),
        "agl.params" => return Ok(settings.params.clone()),
        _ => {}
    }
    if let Some(field) = t.strip_prefix("agl.") {
        if let Some(v) = settings.field(field) {
            return Ok(v);
        }
        anyhow::bail!("unknown placeholder %{token}% (no such launcher setting)");
    }

    if let Some(m) = manifest {
        if let Some(v) = m.field(&t) {
            return Ok(v);
        }
    }
    anyhow::bail!("unknown placeholder %{token}%");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn settings() -> LauncherSettings {
        LauncherSettings {
            folder: PathBuf::from("/etc/agl/services.d"),
            ext: ".yml".to_string(),
            http_timeout_ms: 200,
            state_file: PathBuf::from("/run/agl/state.bin"),
            html_title: None,
            start_timeout_sec: 30,
            log_path: PathBuf::from("/var/log/agl"),
            params: "--verbose".to_string(),
            base_dir: PathBuf::from("/opt/agl"),
        }
    }

    fn manifest(run: &str) -> Manifest {
        crate::agl::manifest::parse_manifest_yaml(
            &format!("Name: web\nLevel: 10\nRun: \"{run}\"\n"),
            std::path::Path::new("web.yml"),
        )
        .expect("manifest")
    }

    #[test]
    fn percent_percent_collapses() {
        let s = settings();
        assert_eq!(expand(&s, None, "100%%").unwrap(), "100%");
        assert_eq!(expand(&s, None, "%%%log%%%").unwrap(), "%/var/log/agl%");
    }

    #[test]
    fn settings_and_manifest_tokens_resolve() {
        let s = settings();
        let m = manifest("/usr/bin/web");
        assert_eq!(
            expand(&s, Some(&m), "%agl.base%/bin %agl.params%").unwrap(),
            "/opt/agl/bin --verbose"
        );
        assert_eq!(expand(&s, Some(&m), "%agl.folder%").unwrap(), "/etc/agl/services.d");
        assert_eq!(expand(&s, Some(&m), "%run%").unwrap(), "/usr/bin/web");
        assert_eq!(expand(&s, Some(&m), "%Name%").unwrap(), "web");
    }

    #[test]
    fn replacement_is_re_expanded() {
        let s = settings();
        let m = manifest("%log%/web.out");
        assert_eq!(expand(&s, Some(&m), "%run%").unwrap(), "/var/log/agl/web.out");
    }

    #[test]
    fn unknown_token_fails() {
        let s = settings();
        let err = expand(&s, None, "%nope%").unwrap_err().to_string();
        assert!(err.contains("unknown placeholder"), "{err}");
        let err = expand(&s, None, "%agl.nope%").unwrap_err().to_string();
        assert!(err.contains("launcher setting"), "{err}");
    }

    #[test]
    fn unterminated_token_fails() {
        let s = settings();
        assert!(expand(&s, None, "broken %token").is_err());
    }

    #[test]
    fn self_reference_hits_the_depth_bound() {
        let s = settings();
        let m = manifest("%run%");
        let err = expand(&s, Some(&m), "%run%").unwrap_err().to_string();
        assert!(err.contains("recursion depth"), "{err}");
    }

    #[test]
    fn now_token_is_filename_safe() {
        let s = settings();
        let v = expand(&s, None, "%agl.now%").unwrap();
        assert!(v.chars().all(|c| c.is_ascii_digit() || c == '_'), "{v}");
    }
}
