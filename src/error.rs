//! Error kinds shared across the session.
//!
//! Every fatal condition the tool can report maps to one variant here, and
//! every variant maps to a process exit code. Helper-process loss is the one
//! distinguished code so callers (and scripts) can tell "your shell exited"
//! from "the proxy collapsed underneath it".

use std::process::ExitStatus;

use thiserror::Error;

/// Exit code when a supervised helper dies while the shell is still alive.
pub const EXIT_PROXY_LOST: i32 = 3;

/// Exit code for preflight failures and fatal setup errors.
pub const EXIT_FAILURE: i32 = 1;

/// Top-level error type for the session controller.
#[derive(Debug, Error)]
pub enum Error {
    /// A required external tool is missing or unusable.
    #[error("{tool} is not usable: {hint}")]
    Preflight { tool: &'static str, hint: String },

    /// An external command exited non-zero.
    #[error("`{argv}` failed ({status}): {captured}")]
    ExternalCommandFailed {
        argv: String,
        status: ExitStatus,
        captured: String,
    },

    /// No pod belonging to the requested deployment was found.
    #[error("no running or pending pod found for deployment {workload}")]
    PodNotFound { workload: String },

    /// The proxy pod never reached Running/ready within the poll budget.
    #[error("pod {pod} never became ready")]
    PodNotReady { pod: String },

    /// The companion image in the cluster does not match this tool.
    #[error(
        "version mismatch: local telepresence is {local} but the deployment \
         runs telepresence-k8s:{remote}; redeploy with a matching image"
    )]
    VersionMismatch { local: String, remote: String },

    /// The secure-shell control channel never answered the readiness probe.
    #[error("tunnel to the proxy pod never became ready")]
    TunnelNotReady,

    /// A supervised helper died while the shell was still running.
    #[error("proxy lost: helper process '{helper}' exited unexpectedly")]
    ProxyLost { helper: String },

    /// kubectl returned JSON we could not understand.
    #[error("unexpected kubectl output: {0}")]
    MalformedOutput(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an [`Error::ExternalCommandFailed`] from a launch vector.
    pub fn command_failed(argv: &[&str], status: ExitStatus, captured: String) -> Self {
        let captured = if captured.trim().is_empty() {
            "see session log".to_string()
        } else {
            captured.trim().to_string()
        };
        Self::ExternalCommandFailed {
            argv: argv.join(" "),
            status,
            captured,
        }
    }

    /// Process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ProxyLost { .. } => EXIT_PROXY_LOST,
            _ => EXIT_FAILURE,
        }
    }

    /// Whether this is an enumerated user-facing failure (one-line report)
    /// or an internal fault that warrants the full bug-report block.
    #[must_use]
    pub fn is_unexpected(&self) -> bool {
        matches!(self, Self::Io(_) | Self::MalformedOutput(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_exit_codes() {
        let lost = Error::ProxyLost {
            helper: "port-forward".into(),
        };
        assert_eq!(lost.exit_code(), EXIT_PROXY_LOST);

        let mismatch = Error::VersionMismatch {
            local: "0.26".into(),
            remote: "0.25".into(),
        };
        assert_eq!(mismatch.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_command_failed_fills_empty_capture() {
        let status = ExitStatus::from_raw(256);
        let err = Error::command_failed(&["kubectl", "get", "pods"], status, String::new());
        let msg = err.to_string();
        assert!(msg.contains("kubectl get pods"));
        assert!(msg.contains("see session log"));
    }

    #[test]
    fn test_version_mismatch_names_both_versions() {
        let err = Error::VersionMismatch {
            local: "0.26".into(),
            remote: "0.25".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.26"));
        assert!(msg.contains("0.25"));
    }
}
