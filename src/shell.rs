//! Launching the proxied local shell.
//!
//! The shell inherits the terminal and the current environment, with the
//! projection layered on top. Its network stack is routed through the SOCKS
//! tunnel by running the user's shell under torsocks with a generated
//! per-session configuration.

use std::collections::BTreeMap;
use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;
use tracing::debug;

use crate::error::Error;
use crate::runner::{ChildProcess, CommandRunner};
use crate::session::Cleanup;

/// Marker prefixed to the prompt so the user can see they are proxied.
pub const PROMPT_MARKER: &str = "[T]";

/// Prefixes whose binaries system-integrity protection shields from library
/// injection on macOS.
const SIP_PREFIXES: [&str; 4] = ["/bin", "/sbin", "/usr/bin", "/usr/sbin"];

/// Everything the launcher needs to compose the shell's world.
pub struct ShellSpec<'a> {
    pub projected: &'a BTreeMap<String, String>,
    pub socks_port: u16,
    pub context: &'a str,
    pub log_path: Option<&'a Path>,
}

/// Render the torsocks configuration for this session.
///
/// Only three options: inbound listeners stay allowed (the user may be
/// running a server), loopback dials bypass the proxy, and everything else
/// goes to the forward-tunnel's local port.
#[must_use]
pub fn torsocks_config(socks_port: u16) -> String {
    format!("AllowInbound 1\nAllowOutboundLocalhost 1\nTorPort {socks_port}\n")
}

/// The user's preferred shell, `/bin/bash` when unset.
#[must_use]
pub fn user_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

/// Environment overrides layered on top of the inherited environment.
#[must_use]
pub fn compose_env(
    spec: &ShellSpec<'_>,
    conf_path: &Path,
    shadow_path: Option<&Path>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = spec
        .projected
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let ps1 = std::env::var("PS1").unwrap_or_default();
    env.push(("PS1".to_string(), format!("{PROMPT_MARKER} {ps1}")));
    env.push((
        "PROMPT_COMMAND".to_string(),
        format!(
            "PS1=\"@{}|$PS1\"; unset PROMPT_COMMAND",
            spec.context
        ),
    ));

    env.push((
        "TORSOCKS_CONF_FILE".to_string(),
        conf_path.display().to_string(),
    ));
    if let Some(log) = spec.log_path {
        env.push((
            "TORSOCKS_LOG_FILE_PATH".to_string(),
            log.display().to_string(),
        ));
    }

    if let Some(shadow) = shadow_path {
        let path = std::env::var("PATH").unwrap_or_default();
        env.push(("PATH".to_string(), format!("{}:{path}", shadow.display())));
    }

    env
}

/// Copy protected-prefix binaries into a shadow directory torsocks can
/// inject into.
///
/// Returns `None` on platforms without the restriction. Copies are
/// best-effort: unreadable entries are skipped.
///
/// # Errors
///
/// Fails only when the shadow directory itself cannot be created.
pub fn sip_shadow_dir() -> std::io::Result<Option<TempDir>> {
    if !cfg!(target_os = "macos") {
        return Ok(None);
    }

    let dir = tempfile::Builder::new()
        .prefix("telepresence-bin-")
        .tempdir()?;
    for prefix in SIP_PREFIXES {
        let Ok(entries) = std::fs::read_dir(prefix) else {
            continue;
        };
        for entry in entries.flatten() {
            let src = entry.path();
            let Some(file_name) = src.file_name() else {
                continue;
            };
            let dst = dir.path().join(file_name);
            if std::fs::copy(&src, &dst).is_err() {
                continue;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o755));
            }
        }
    }
    debug!(path = %dir.path().display(), "created SIP shadow directory");
    Ok(Some(dir))
}

/// Write the torsocks config, compose the environment, and start the shell.
///
/// Registers a teardown that terminates the shell if still alive and removes
/// the generated config (and shadow directory, when one exists).
///
/// # Errors
///
/// Fails when the config cannot be written or the shell cannot be spawned.
pub fn launch(
    runner: &CommandRunner,
    spec: &ShellSpec<'_>,
    cleanup: &mut Cleanup,
) -> Result<ChildProcess, Error> {
    let conf = tempfile::Builder::new()
        .prefix("telepresence-torsocks-")
        .suffix(".conf")
        .tempfile()?;
    std::fs::write(conf.path(), torsocks_config(spec.socks_port))?;

    let shadow = sip_shadow_dir()?;
    let env = compose_env(spec, conf.path(), shadow.as_ref().map(TempDir::path));

    let shell = user_shell();
    let child = runner.spawn_interactive("shell", &["torsocks", shell.as_str()], &env)?;

    let pid = child.pid();
    cleanup.register("shell and torsocks config", move || {
        if let Some(pid) = pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        // dropping the handles removes the config file and shadow directory
        drop(conf);
        drop(shadow);
    });

    Ok(child)
}
