//! Session preflight.
//!
//! All three external collaborators must be usable before any cluster state
//! is touched. Each failure maps to a one-line error and exit code 1.

use tracing::debug;

use crate::error::Error;
use crate::kubectl::Kubectl;

/// Facts established by a successful preflight.
pub struct Preflight {
    /// Active cluster context, reused for the shell prompt.
    pub context: String,
}

fn require_tool(tool: &'static str) -> Result<(), Error> {
    match which::which(tool) {
        Ok(path) => {
            debug!(tool, path = %path.display(), "found");
            Ok(())
        }
        Err(_) => Err(Error::Preflight {
            tool,
            hint: "install it and make sure it is on PATH".to_string(),
        }),
    }
}

/// Verify kubectl (with an active context), ssh, and torsocks.
///
/// # Errors
///
/// Returns [`Error::Preflight`] naming the first unusable tool.
pub async fn check(kubectl: &Kubectl) -> Result<Preflight, Error> {
    require_tool("kubectl")?;
    require_tool("ssh")?;
    require_tool("torsocks")?;

    // cheap read-only call that also proves a context is configured
    let context = kubectl
        .current_context_name()
        .await
        .map_err(|_| Error::Preflight {
            tool: "kubectl",
            hint: "no active cluster context (run `kubectl config use-context`)".to_string(),
        })?;

    Ok(Preflight { context })
}
