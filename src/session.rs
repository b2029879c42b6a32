//! Session lifecycle: staged startup, supervision, teardown.
//!
//! The session is strictly staged: create workload → resolve pod → tunnels
//! up → environment captured → shell started. No step begins before the
//! previous one reported success. After startup the controller only watches:
//! the shell exiting is the success path, any helper dying first is proxy
//! loss, and both signals route through the same teardown stack.
//!
//! Signal streams are installed before any cluster state is touched and the
//! whole startup races against them, so an interrupt during the readiness
//! polls still drains the cleanup stack instead of leaking a workload.

use std::process::ExitStatus;
use std::time::{Duration, Instant};

use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{Settings, COMPANION_IMAGE_NAME};
use crate::envproj;
use crate::error::Error;
use crate::kubectl::{Kubectl, Workload};
use crate::pod::{self, PodRef};
use crate::preflight;
use crate::runner::{ChildProcess, CommandRunner, LogSink};
use crate::shell::{self, ShellSpec};
use crate::tunnel::{self, TunnelSet};
use crate::ui;

/// Settling window between the control channel reporting ready and the
/// reverse/forward bindings being usable end to end.
const SETTLE: Duration = Duration::from_secs(5);

/// Supervision poll tick; child death is observed within two ticks.
const WATCH_TICK: Duration = Duration::from_millis(100);

/// A second identical signal inside this window escalates terminate to kill.
const SIGNAL_ESCALATION_WINDOW: Duration = Duration::from_secs(2);

/// How long a terminated child gets before SIGKILL.
const DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Interactive shells may ignore SIGTERM; force-kill after this grace.
const SHELL_GRACE: Duration = Duration::from_secs(5);

type Action = Box<dyn FnOnce() + Send>;

/// Deferred teardown actions, run exactly once in reverse registration
/// order. Runs on drop too, so teardown survives panic unwinding.
#[derive(Default)]
pub struct Cleanup {
    actions: Vec<(String, Action)>,
}

impl Cleanup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown action.
    pub fn register(&mut self, label: impl Into<String>, action: impl FnOnce() + Send + 'static) {
        self.actions.push((label.into(), Box::new(action)));
    }

    /// Register termination of a child process by pid.
    ///
    /// The watch loop also terminates children on its own paths; SIGTERM to
    /// an already-gone pid is harmless, which keeps the stack idempotent.
    pub fn register_child(&mut self, name: &str, pid: Option<u32>) {
        self.register(format!("stop {name}"), move || {
            if let Some(pid) = pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        });
    }

    /// Drain all actions, most recent first. Safe to call more than once.
    pub fn run(&mut self) {
        while let Some((label, action)) = self.actions.pop() {
            debug!(%label, "cleanup");
            action();
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.run();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Starting,
    Running,
    Draining,
    Exited,
}

fn advance(state: &mut State, next: State) {
    debug!(from = ?*state, to = ?next, "session state");
    *state = next;
}

enum Outcome {
    ShellExited(ExitStatus),
    HelperDied(String),
}

/// Run one complete session; returns the process exit code.
///
/// # Errors
///
/// Enumerated failures carry their own exit codes; anything else is an
/// internal fault for the caller's crash reporter.
pub async fn run(settings: Settings) -> anyhow::Result<i32> {
    let sink = match &settings.logfile {
        Some(path) => LogSink::file(path)?,
        None => LogSink::stdout(),
    };
    sink.write_line(&format!(
        "Telepresence {} session started at {}",
        settings.version,
        Utc::now().to_rfc3339()
    ));

    let runner = CommandRunner::new(sink);
    let kubectl = Kubectl::new(runner.clone());

    let preflight = preflight::check(&kubectl).await?;
    ui::print_info(&format!(
        "Starting proxy session for deployment {} (context {})",
        settings.workload, preflight.context
    ));

    // Handlers must exist before any cluster state does: a signal during
    // the staged startup has to drain the same teardown stack.
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let mut state = State::Starting;
    let mut cleanup = Cleanup::new();

    let started = tokio::select! {
        res = start_session(&settings, &runner, &kubectl, &preflight.context, &mut cleanup) => Some(res),
        _ = sigint.recv() => None,
        _ = sigterm.recv() => None,
    };

    let (mut shell, mut tunnels, pod) = match started {
        Some(Ok(parts)) => parts,
        Some(Err(err)) => {
            advance(&mut state, State::Draining);
            cleanup.run();
            advance(&mut state, State::Exited);
            return Err(err.into());
        }
        None => {
            ui::print_warning("signal received during startup, shutting the session down");
            advance(&mut state, State::Draining);
            cleanup.run();
            advance(&mut state, State::Exited);
            return Ok(0);
        }
    };

    ui::print_success(&format!(
        "Proxy established to pod {} ({COMPANION_IMAGE_NAME}:{})",
        pod.pod_name, pod.companion_image_tag
    ));
    debug!(
        control_port = tunnels.control_port,
        socks_port = tunnels.socks_port,
        "tunnel ports"
    );
    advance(&mut state, State::Running);

    let outcome = watch(&mut shell, &mut tunnels.supervised, &mut sigint, &mut sigterm).await;
    advance(&mut state, State::Draining);

    let result = match outcome {
        Outcome::ShellExited(status) => {
            debug!(?status, "shell exited");
            drain(&mut tunnels.supervised).await;
            Ok(status.code().unwrap_or(0))
        }
        Outcome::HelperDied(helper) => {
            shell.terminate();
            if shell.wait_timeout(DRAIN_WAIT).await.is_none() {
                shell.force_kill();
                let _ = shell.wait_timeout(DRAIN_WAIT).await;
            }
            drain(&mut tunnels.supervised).await;
            Err(Error::ProxyLost { helper })
        }
    };

    cleanup.run();
    advance(&mut state, State::Exited);

    result.map_err(Into::into)
}

/// The staged startup: everything between preflight and the watch loop.
///
/// Every resource is registered with `cleanup` before (or as) it comes into
/// existence, so cancelling this future at any await point leaves nothing
/// behind once the stack drains.
async fn start_session(
    settings: &Settings,
    runner: &CommandRunner,
    kubectl: &Kubectl,
    context: &str,
    cleanup: &mut Cleanup,
) -> Result<(ChildProcess, TunnelSet, PodRef), Error> {
    if settings.create_workload {
        // registered first: the delete ignores not-found, so unwinding a
        // half-finished create is safe
        register_workload_deletion(cleanup, runner, settings);
        kubectl
            .create_workload(
                settings.namespace.as_deref(),
                &settings.workload,
                &settings.companion_image(),
                &settings.expose,
            )
            .await?;
    }

    let workload_spec = kubectl
        .get_workload_spec(settings.namespace.as_deref(), &settings.workload)
        .await?;
    let pod = pod::resolve(
        kubectl,
        &workload_spec,
        settings.namespace.as_deref(),
        &settings.workload,
        &settings.version,
    )
    .await?;

    let tunnels = tunnel::establish(runner, kubectl, &pod, &settings.expose, cleanup).await?;
    // the reverse/forward bindings lag the control channel becoming usable
    sleep(SETTLE).await;

    let raw_env = kubectl
        .exec(&pod.namespace, &pod.pod_name, &pod.container_name, &["env"])
        .await?;
    let pod_env = envproj::parse_pod_env(&raw_env);
    let declared = declared_env(&workload_spec, &pod.container_name);
    let projected = envproj::project(&pod_env, &declared, &pod.pod_name, &pod.container_name);

    let spec = ShellSpec {
        projected: &projected,
        socks_port: tunnels.socks_port,
        context,
        log_path: settings.logfile.as_deref(),
    };
    let shell = shell::launch(runner, &spec, cleanup)?;

    Ok((shell, tunnels, pod))
}

/// The session owns deletion of a workload it created.
fn register_workload_deletion(cleanup: &mut Cleanup, runner: &CommandRunner, settings: &Settings) {
    let runner = runner.clone();
    let namespace = settings.namespace.clone();
    let name = settings.workload.clone();
    cleanup.register("delete created deployment", move || {
        let mut argv = vec![
            "kubectl".to_string(),
            "delete".to_string(),
            "service,deployment".to_string(),
            name,
            "--ignore-not-found".to_string(),
        ];
        if let Some(ns) = namespace {
            argv.push("-n".to_string());
            argv.push(ns);
        }
        let refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        if let Err(err) = runner.run_blocking(&refs) {
            warn!(%err, "failed to delete created deployment");
        }
    });
}

/// Env names declared on the companion container in the workload spec.
fn declared_env(workload: &Workload, container_name: &str) -> Vec<String> {
    workload
        .spec
        .template
        .spec
        .containers
        .iter()
        .find(|c| c.name == container_name || c.image.contains(COMPANION_IMAGE_NAME))
        .map(|c| c.env.iter().map(|e| e.name.clone()).collect())
        .unwrap_or_default()
}

/// Block until the shell exits or a helper dies, reacting to signals.
async fn watch(
    shell: &mut ChildProcess,
    helpers: &mut Vec<ChildProcess>,
    sigint: &mut SignalStream,
    sigterm: &mut SignalStream,
) -> Outcome {
    let mut tick = tokio::time::interval(WATCH_TICK);

    let mut last_signal: Option<(&'static str, Instant)> = None;
    let mut draining = false;
    let mut force_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Some(status) = shell.poll_exit() {
                    return Outcome::ShellExited(status);
                }
                if draining {
                    if force_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        shell.force_kill();
                        force_deadline = None;
                    }
                } else {
                    let mut dead = None;
                    for helper in helpers.iter_mut() {
                        if !helper.is_alive() {
                            dead = Some(helper.name().to_string());
                            break;
                        }
                    }
                    if let Some(name) = dead {
                        return Outcome::HelperDied(name);
                    }
                }
            }
            _ = sigint.recv() => {
                handle_signal("SIGINT", shell, helpers, &mut last_signal, &mut draining, &mut force_deadline);
            }
            _ = sigterm.recv() => {
                handle_signal("SIGTERM", shell, helpers, &mut last_signal, &mut draining, &mut force_deadline);
            }
        }
    }
}

fn handle_signal(
    name: &'static str,
    shell: &mut ChildProcess,
    helpers: &mut [ChildProcess],
    last_signal: &mut Option<(&'static str, Instant)>,
    draining: &mut bool,
    force_deadline: &mut Option<Instant>,
) {
    let now = Instant::now();
    let escalate = matches!(
        *last_signal,
        Some((prev, at)) if prev == name && now.duration_since(at) < SIGNAL_ESCALATION_WINDOW
    );
    *last_signal = Some((name, now));
    *draining = true;

    if escalate {
        ui::print_warning(&format!("second {name}, killing remaining processes"));
        shell.force_kill();
        for helper in helpers.iter_mut() {
            helper.force_kill();
        }
        *force_deadline = None;
    } else {
        ui::print_warning(&format!("{name} received, shutting the session down"));
        shell.terminate();
        for helper in helpers.iter_mut() {
            helper.terminate();
        }
        *force_deadline = Some(now + SHELL_GRACE);
    }
}

/// Terminate every child, escalating to SIGKILL after a short wait.
async fn drain(children: &mut Vec<ChildProcess>) {
    for child in children.iter_mut() {
        child.terminate();
    }
    for child in children.iter_mut() {
        if child.wait_timeout(DRAIN_WAIT).await.is_none() {
            child.force_kill();
            let _ = child.wait_timeout(DRAIN_WAIT).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_cleanup_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut cleanup = Cleanup::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            cleanup.register(format!("action {i}"), move || {
                order.lock().unwrap().push(i);
            });
        }
        cleanup.run();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_cleanup_actions_run_exactly_once() {
        let count = Arc::new(Mutex::new(0));
        let mut cleanup = Cleanup::new();
        {
            let count = Arc::clone(&count);
            cleanup.register("bump", move || {
                *count.lock().unwrap() += 1;
            });
        }
        cleanup.run();
        cleanup.run();
        drop(cleanup);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_cleanup_runs_on_drop() {
        let ran = Arc::new(Mutex::new(false));
        {
            let ran = Arc::clone(&ran);
            let mut cleanup = Cleanup::new();
            cleanup.register("mark", move || {
                *ran.lock().unwrap() = true;
            });
        }
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_declared_env_finds_companion_container() {
        let json = r#"{
            "metadata": {"name": "web"},
            "spec": {
                "template": {
                    "metadata": {},
                    "spec": {
                        "containers": [
                            {"name": "other", "image": "example/app:1",
                             "env": [{"name": "NOPE", "value": "x"}]},
                            {"name": "proxy", "image": "datawire/telepresence-k8s:0.26",
                             "env": [{"name": "BAR", "value": "2"}, {"name": "BAZ"}]}
                        ]
                    }
                }
            }
        }"#;
        let workload: Workload = serde_json::from_str(json).unwrap();
        let declared = declared_env(&workload, "proxy");
        assert_eq!(declared, vec!["BAR".to_string(), "BAZ".to_string()]);
    }

    #[test]
    fn test_state_transitions_are_forward_only() {
        let mut state = State::Starting;
        advance(&mut state, State::Running);
        advance(&mut state, State::Draining);
        advance(&mut state, State::Exited);
        assert_eq!(state, State::Exited);
    }
}
