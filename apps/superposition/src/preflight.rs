//! Startup checks for external tools. Git is required; the coding CLIs are
//! optional and reported through `/api/health`.

use std::env;
use std::path::PathBuf;

use serde::Serialize;

/// Command names the session layer will start. Anything else is rejected by
/// the REST layer before it reaches a manager.
pub const ALLOWED_CLIS: [&str; 3] = ["claude", "codex", "gemini"];

#[derive(Debug, Clone, Serialize)]
pub struct CliStatus {
    pub name: String,
    pub installed: bool,
    pub authed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

pub fn is_allowed_cli(name: &str) -> bool {
    ALLOWED_CLIS.contains(&name)
}

pub fn check_all() -> (Vec<CliStatus>, bool) {
    let git_ok = look_path("git").is_some();
    let clis: Vec<CliStatus> = ALLOWED_CLIS.iter().map(|name| check_cli(name)).collect();

    if !git_ok {
        println!("⚠ git is not installed. Please install git to use Superposition.");
    }
    for cli in &clis {
        if cli.installed {
            println!(
                "✓ {} found ({})",
                cli.name,
                cli.path.as_deref().unwrap_or("")
            );
        } else {
            println!(
                "⚠ {} is not installed. Install it to use {} sessions.",
                cli.name, cli.name
            );
        }
    }

    (clis, git_ok)
}

fn check_cli(name: &str) -> CliStatus {
    match look_path(name) {
        // Auth is handled by the CLI itself inside the PTY session; only the
        // binary's presence is probed here.
        Some(path) => CliStatus {
            name: name.to_string(),
            installed: true,
            authed: true,
            path: Some(path.to_string_lossy().into_owned()),
        },
        None => CliStatus {
            name: name.to_string(),
            installed: false,
            authed: false,
            path: None,
        },
    }
}

/// Resolve a command name against `$PATH`, like `exec.LookPath`.
pub fn look_path(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &PathBuf) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_is_closed() {
        assert!(is_allowed_cli("claude"));
        assert!(is_allowed_cli("codex"));
        assert!(is_allowed_cli("gemini"));
        assert!(!is_allowed_cli("bash"));
        assert!(!is_allowed_cli("rm"));
        assert!(!is_allowed_cli(""));
    }

    #[test]
    fn look_path_finds_standard_tools() {
        // sh is present on any unix worth running a PTY on.
        assert!(look_path("sh").is_some());
        assert!(look_path("definitely-not-a-real-binary-37").is_none());
    }
}
