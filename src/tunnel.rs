//! Tunnel construction and supervision.
//!
//! The control channel is a kubectl port-forward to the companion
//! container's sshd; every further tunnel (one reverse-forward per exposed
//! port, one forward-tunnel for the in-pod SOCKS proxy) is an ssh session
//! over that channel. Nothing here is restarted: the ServerAlive settings
//! make an ssh child die within a few seconds of network loss, and that
//! death is the signal the supervisor reacts to.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::debug;

use crate::error::Error;
use crate::kubectl::Kubectl;
use crate::pod::PodRef;
use crate::runner::{ChildProcess, CommandRunner};
use crate::session::Cleanup;

/// sshd port inside the companion container.
pub const REMOTE_SSH_PORT: u16 = 22;

/// Well-known port of the SOCKS proxy inside the companion container.
pub const REMOTE_SOCKS_PORT: u16 = 9050;

const PROBE_ATTEMPTS: u32 = 30;
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

const SSH_TARGET: &str = "root@localhost";

/// The established tunnel ensemble.
///
/// Every supervised child must stay alive for the set to be usable; the
/// first death invalidates the whole session.
pub struct TunnelSet {
    /// Local port carrying the ssh control channel over the port-forward.
    /// Not dialed again after setup; retained for diagnostics.
    pub control_port: u16,
    /// Local port the shell's SOCKS wrapper dials.
    pub socks_port: u16,
    pub supervised: Vec<ChildProcess>,
}

/// Pick a free loopback port.
///
/// Bind zero, read the assignment, release. The port can in principle be
/// claimed by another process before our child binds it again; known
/// limitation of the handoff.
///
/// # Errors
///
/// Fails when no loopback socket can be bound.
pub fn free_port() -> Result<u16, Error> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// ssh flags shared by the probe and every tunnel session.
///
/// Host keys are ephemeral per pod, so validation is off and nothing is
/// persisted. ServerAlive 1s/3 makes a dead link surface as child exit
/// within about three seconds.
fn ssh_option_args(control_port: u16) -> Vec<String> {
    vec![
        "-q".into(),
        "-oStrictHostKeyChecking=no".into(),
        "-oUserKnownHostsFile=/dev/null".into(),
        "-oServerAliveInterval=1".into(),
        "-oServerAliveCountMax=3".into(),
        "-p".into(),
        control_port.to_string(),
    ]
}

/// Probe the control channel: TCP connect to the port-forward, then a no-op
/// command through ssh. Retried inside the budget; the final failure is
/// [`Error::TunnelNotReady`].
async fn wait_for_control_channel(
    runner: &CommandRunner,
    control_port: u16,
) -> Result<(), Error> {
    for attempt in 0..PROBE_ATTEMPTS {
        if TcpStream::connect(("127.0.0.1", control_port)).await.is_ok() {
            let mut argv: Vec<String> = vec!["ssh".into()];
            argv.extend(ssh_option_args(control_port));
            argv.push(SSH_TARGET.into());
            argv.push("/bin/true".into());
            let refs: Vec<&str> = argv.iter().map(String::as_str).collect();
            if runner.run(&refs).await.is_ok() {
                debug!(control_port, attempt, "control channel is up");
                return Ok(());
            }
        }
        sleep(PROBE_INTERVAL).await;
    }
    Err(Error::TunnelNotReady)
}

fn spawn_ssh_tunnel(
    runner: &CommandRunner,
    cleanup: &mut Cleanup,
    name: &str,
    control_port: u16,
    binding_flag: &str,
    binding: &str,
) -> Result<ChildProcess, Error> {
    let mut argv: Vec<String> = vec!["ssh".into()];
    argv.extend(ssh_option_args(control_port));
    argv.push("-N".into());
    argv.push(binding_flag.into());
    argv.push(binding.into());
    argv.push(SSH_TARGET.into());
    let refs: Vec<&str> = argv.iter().map(String::as_str).collect();
    let child = runner.spawn(name, &refs)?;
    cleanup.register_child(name, child.pid());
    Ok(child)
}

/// Build the full tunnel ensemble for a resolved pod.
///
/// Teardown for every spawned child is registered as it is created, so a
/// failure partway through still unwinds what exists.
///
/// # Errors
///
/// - [`Error::TunnelNotReady`] when the control channel never answers.
/// - Spawn failures propagate as is.
pub async fn establish(
    runner: &CommandRunner,
    kubectl: &Kubectl,
    pod: &PodRef,
    expose: &[u16],
    cleanup: &mut Cleanup,
) -> Result<TunnelSet, Error> {
    let control_port = free_port()?;
    let mut supervised = Vec::new();

    let forward = kubectl.port_forward(&pod.namespace, &pod.pod_name, control_port, REMOTE_SSH_PORT)?;
    cleanup.register_child(forward.name(), forward.pid());
    supervised.push(forward);

    wait_for_control_channel(runner, control_port).await?;

    for &port in expose {
        let binding = format!("*:{port}:127.0.0.1:{port}");
        let name = format!("reverse-forward-{port}");
        supervised.push(spawn_ssh_tunnel(
            runner,
            cleanup,
            &name,
            control_port,
            "-R",
            &binding,
        )?);
    }

    let socks_port = free_port()?;
    let binding = format!("127.0.0.1:{socks_port}:127.0.0.1:{REMOTE_SOCKS_PORT}");
    supervised.push(spawn_ssh_tunnel(
        runner,
        cleanup,
        "socks-tunnel",
        control_port,
        "-L",
        &binding,
    )?);

    Ok(TunnelSet {
        control_port,
        socks_port,
        supervised,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_port_is_bindable_and_nonzero() {
        let port = free_port().unwrap();
        assert_ne!(port, 0);
        // the released port is immediately reusable
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_ssh_options_disable_host_key_persistence() {
        let args = ssh_option_args(41234);
        assert!(args.contains(&"-oStrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"-oUserKnownHostsFile=/dev/null".to_string()));
        assert!(args.contains(&"-q".to_string()));
        let port_idx = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[port_idx + 1], "41234");
    }

    #[test]
    fn test_ssh_options_keep_the_link_probed() {
        let args = ssh_option_args(1);
        assert!(args.contains(&"-oServerAliveInterval=1".to_string()));
        assert!(args.contains(&"-oServerAliveCountMax=3".to_string()));
    }
}
