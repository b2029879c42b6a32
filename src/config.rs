//! CLI surface and resolved session settings.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::bail;
use clap::{ArgGroup, Parser};

/// Registry the companion image is pulled from unless overridden.
const DEFAULT_REGISTRY: &str = "datawire";

/// Name of the companion image within the registry.
pub const COMPANION_IMAGE_NAME: &str = "telepresence-k8s";

/// Effective tool version.
///
/// `TELEPRESENCE_VERSION` overrides the built-in crate version; the override
/// exists so tests can pin the version-mismatch check.
#[must_use]
pub fn tool_version() -> String {
    std::env::var("TELEPRESENCE_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
}

fn tool_version_static() -> &'static str {
    Box::leak(tool_version().into_boxed_str())
}

/// Registry prefix for the companion image, honoring `TELEPRESENCE_REGISTRY`.
#[must_use]
pub fn registry() -> String {
    std::env::var("TELEPRESENCE_REGISTRY").unwrap_or_else(|_| DEFAULT_REGISTRY.to_string())
}

/// Run a local shell with the network identity of a pod in a remote cluster.
#[derive(Debug, Parser)]
#[command(
    name = "telepresence",
    version = tool_version_static(),
    about = "Local development against a remote Kubernetes cluster",
    long_about = "Swap a local shell in for a Kubernetes workload.\n\n\
                  The shell sees the pod's service-discovery environment and dials\n\
                  cluster-internal addresses through a SOCKS tunnel, while exposed\n\
                  local ports become reachable from inside the cluster."
)]
#[command(group(
    ArgGroup::new("target").required(true).args(["deployment", "new_deployment"])
))]
pub struct Cli {
    /// Adopt an existing deployment that runs the companion image.
    #[arg(long, value_name = "NAME")]
    pub deployment: Option<String>,

    /// Create a new deployment running the companion image; deleted on exit.
    #[arg(long, value_name = "NAME")]
    pub new_deployment: Option<String>,

    /// Kubernetes namespace (defaults to kubectl's active namespace).
    #[arg(long, value_name = "NAME")]
    pub namespace: Option<String>,

    /// Local port to make reachable from the cluster (repeatable).
    #[arg(long, value_name = "PORT")]
    pub expose: Vec<u16>,

    /// Proxy a local shell (required; reserved for future alternative modes).
    #[arg(long)]
    pub run_shell: bool,

    /// Log file for subprocess output; `-` means standard output.
    #[arg(long, value_name = "PATH", default_value = "./telepresence.log")]
    pub logfile: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Settings resolved once at startup from flags and environment overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Deployment name the session attaches to.
    pub workload: String,
    /// True when the session creates (and therefore owns) the deployment.
    pub create_workload: bool,
    /// Namespace flag; `None` defers to kubectl's active namespace.
    pub namespace: Option<String>,
    /// Local ports reachable from the cluster.
    pub expose: Vec<u16>,
    /// Session log file; `None` means standard output.
    pub logfile: Option<PathBuf>,
    /// Version string used for the companion image tag and mismatch checks.
    pub version: String,
    /// Registry prefix for the companion image.
    pub registry: String,
}

impl Settings {
    /// Resolve and validate the CLI into session settings.
    ///
    /// # Errors
    ///
    /// Returns an error for missing `--run-shell`, a zero port, or a
    /// duplicated `--expose` value.
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        if !cli.run_shell {
            bail!("--run-shell is required (other modes are not implemented)");
        }

        let mut seen = HashSet::new();
        for &port in &cli.expose {
            if port == 0 {
                bail!("--expose 0 is not a usable port");
            }
            if !seen.insert(port) {
                bail!("--expose {port} given more than once");
            }
        }

        let (workload, create_workload) = match (&cli.deployment, &cli.new_deployment) {
            (Some(name), None) => (name.clone(), false),
            (None, Some(name)) => (name.clone(), true),
            // clap's target group enforces exactly one
            _ => bail!("exactly one of --deployment or --new-deployment is required"),
        };

        let logfile = if cli.logfile.as_os_str() == "-" {
            None
        } else {
            Some(cli.logfile.clone())
        };

        Ok(Self {
            workload,
            create_workload,
            namespace: cli.namespace.clone(),
            expose: cli.expose.clone(),
            logfile,
            version: tool_version(),
            registry: registry(),
        })
    }

    /// Full companion image reference for this session.
    #[must_use]
    pub fn companion_image(&self) -> String {
        format!("{}/{}:{}", self.registry, COMPANION_IMAGE_NAME, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(args: &[&str]) -> anyhow::Result<Settings> {
        let cli = Cli::try_parse_from(args)?;
        Settings::resolve(&cli)
    }

    #[test]
    fn test_adopt_existing_deployment() {
        let s = settings(&["telepresence", "--deployment", "web", "--run-shell"]).unwrap();
        assert_eq!(s.workload, "web");
        assert!(!s.create_workload);
        assert_eq!(s.logfile, Some(PathBuf::from("./telepresence.log")));
    }

    #[test]
    fn test_new_deployment_is_owned() {
        let s = settings(&["telepresence", "--new-deployment", "dev", "--run-shell"]).unwrap();
        assert_eq!(s.workload, "dev");
        assert!(s.create_workload);
    }

    #[test]
    fn test_deployment_flags_are_mutually_exclusive() {
        let result = Cli::try_parse_from([
            "telepresence",
            "--deployment",
            "web",
            "--new-deployment",
            "dev",
            "--run-shell",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_one_deployment_flag_is_required() {
        let result = Cli::try_parse_from(["telepresence", "--run-shell"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_shell_is_required() {
        let result = settings(&["telepresence", "--deployment", "web"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_expose_repeats_and_rejects_duplicates() {
        let s = settings(&[
            "telepresence",
            "--deployment",
            "web",
            "--expose",
            "8080",
            "--expose",
            "9090",
            "--run-shell",
        ])
        .unwrap();
        assert_eq!(s.expose, vec![8080, 9090]);

        let dup = settings(&[
            "telepresence",
            "--deployment",
            "web",
            "--expose",
            "8080",
            "--expose",
            "8080",
            "--run-shell",
        ]);
        assert!(dup.is_err());
    }

    #[test]
    fn test_logfile_dash_means_stdout() {
        let s = settings(&[
            "telepresence",
            "--deployment",
            "web",
            "--logfile",
            "-",
            "--run-shell",
        ])
        .unwrap();
        assert_eq!(s.logfile, None);
    }

    #[test]
    fn test_companion_image_reference() {
        let s = Settings {
            workload: "web".into(),
            create_workload: false,
            namespace: None,
            expose: vec![],
            logfile: None,
            version: "0.26".into(),
            registry: "example.io/dw".into(),
        };
        assert_eq!(s.companion_image(), "example.io/dw/telepresence-k8s:0.26");
    }
}
