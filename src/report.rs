//! Diagnostics offered when the session dies unexpectedly.
//!
//! Enumerated failures get a one-liner; anything else gets this block so the
//! user can paste a useful bug report.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;

const ISSUE_URL: &str = "https://github.com/datawire/telepresence/issues/new";
const LOG_TAIL_LINES: usize = 20;

/// Last `max_lines` lines of the session log, or a placeholder.
#[must_use]
pub fn log_tail(path: &Path, max_lines: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().collect();
            let start = lines.len().saturating_sub(max_lines);
            lines[start..].join("\n")
        }
        Err(_) => "(session log unavailable)".to_string(),
    }
}

/// kubectl client version, best effort; the crash path must not fail.
fn kubectl_client_version() -> String {
    Command::new("kubectl")
        .args(["version", "--client"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .unwrap_or_else(|| "(unavailable)".to_string())
}

/// Render the bug-report block for an unexpected failure.
#[must_use]
pub fn render(error: &anyhow::Error, version: &str, log_path: Option<&Path>) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Looks like you have hit an internal error.");
    let _ = writeln!(out, "Please consider filing an issue at {ISSUE_URL}");
    let _ = writeln!(out, "with the details below.\n");

    let argv: Vec<String> = std::env::args().collect();
    let _ = writeln!(out, "Command line: {}", argv.join(" "));
    let _ = writeln!(out, "Version: {version}");
    let _ = writeln!(out, "kubectl: {}", kubectl_client_version());
    let _ = writeln!(
        out,
        "OS: {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    let _ = writeln!(out, "Error: {error:#}");

    if let Some(path) = log_path {
        let _ = writeln!(out, "\nLog tail ({}):", path.display());
        let _ = writeln!(out, "{}", log_tail(path, LOG_TAIL_LINES));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_tail_returns_last_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..30 {
            writeln!(file, "line {i}").unwrap();
        }
        let tail = log_tail(file.path(), 5);
        assert!(tail.starts_with("line 25"));
        assert!(tail.ends_with("line 29"));
    }

    #[test]
    fn test_log_tail_handles_missing_file() {
        let tail = log_tail(Path::new("/nonexistent/telepresence.log"), 5);
        assert_eq!(tail, "(session log unavailable)");
    }

    #[test]
    fn test_render_includes_version_and_error() {
        let err = anyhow::anyhow!("boom");
        let block = render(&err, "0.26", None);
        assert!(block.contains("Version: 0.26"));
        assert!(block.contains("boom"));
        assert!(block.contains(ISSUE_URL));
    }
}
