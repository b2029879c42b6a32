//! Typed façade over the kubectl CLI.
//!
//! kubectl is treated as an opaque collaborator: every operation here shells
//! out and, where structure is needed, asks for `-o json` and deserializes
//! the subset of fields the session cares about. Failures propagate verbatim;
//! retry budgets live with the callers.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::Error;
use crate::runner::{ChildProcess, CommandRunner};

/// Object metadata subset: name, namespace, labels.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A declared environment variable on a container spec.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// A container within a pod spec or pod template.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// Pod spec subset: just the container list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

/// Readiness of one container inside a running pod.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
}

/// Pod status subset: phase and per-container readiness.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

/// One pod as returned by `kubectl get pods -o json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

/// Pod template inside a workload spec.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

/// Workload (deployment) spec subset.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(default)]
    pub template: PodTemplateSpec,
}

/// A workload as returned by `kubectl get deployment -o json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: WorkloadSpec,
}

/// Gateway to the cluster control plane.
#[derive(Clone)]
pub struct Kubectl {
    runner: CommandRunner,
}

impl Kubectl {
    #[must_use]
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }

    /// Short name of the active cluster context.
    ///
    /// # Errors
    ///
    /// Fails when kubectl is missing or no context is configured.
    pub async fn current_context_name(&self) -> Result<String, Error> {
        self.runner
            .capture(&["kubectl", "config", "current-context"])
            .await
    }

    /// Create a deployment named `name` running `image`, first deleting any
    /// service or deployment of the same name. When `exposed_ports` is
    /// non-empty a service exposing them is applied as well.
    ///
    /// # Errors
    ///
    /// Propagates any kubectl failure; nothing is retried.
    pub async fn create_workload(
        &self,
        namespace: Option<&str>,
        name: &str,
        image: &str,
        exposed_ports: &[u16],
    ) -> Result<(), Error> {
        self.delete_workload(namespace, name).await?;

        let image_flag = format!("--image={image}");
        let mut args = vec!["kubectl", "create", "deployment", name, &image_flag];
        append_namespace(&mut args, namespace);
        self.runner.run(&args).await?;

        if !exposed_ports.is_empty() {
            let manifest = service_manifest(namespace, name, exposed_ports);
            let mut args = vec!["kubectl", "apply", "-f", "-"];
            append_namespace(&mut args, namespace);
            self.runner.run_with_stdin(&args, &manifest).await?;
        }
        Ok(())
    }

    /// Delete the deployment and service of this name; absent is fine.
    ///
    /// # Errors
    ///
    /// Propagates kubectl failures other than not-found.
    pub async fn delete_workload(&self, namespace: Option<&str>, name: &str) -> Result<(), Error> {
        let mut args = vec![
            "kubectl",
            "delete",
            "service,deployment",
            name,
            "--ignore-not-found",
        ];
        append_namespace(&mut args, namespace);
        self.runner.run(&args).await
    }

    /// Fetch the structured workload description.
    ///
    /// # Errors
    ///
    /// Fails when the deployment does not exist or its JSON is malformed.
    pub async fn get_workload_spec(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Workload, Error> {
        let mut args = vec!["kubectl", "get", "deployment", name, "-o", "json"];
        append_namespace(&mut args, namespace);
        let json = self.runner.capture(&args).await?;
        Ok(serde_json::from_str(&json)?)
    }

    /// List pods in `namespace`.
    ///
    /// # Errors
    ///
    /// Fails when kubectl fails or its JSON is malformed.
    pub async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error> {
        let args = ["kubectl", "get", "pods", "-n", namespace, "-o", "json"];
        let json = self.runner.capture(&args).await?;
        let list: PodList = serde_json::from_str(&json)?;
        Ok(list.items)
    }

    /// Fetch a single pod by name.
    ///
    /// # Errors
    ///
    /// Fails when the pod does not exist or its JSON is malformed.
    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, Error> {
        let args = ["kubectl", "get", "pod", name, "-n", namespace, "-o", "json"];
        let json = self.runner.capture(&args).await?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Execute `argv` inside a container and capture its stdout.
    ///
    /// # Errors
    ///
    /// Propagates the remote command's failure.
    pub async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[&str],
    ) -> Result<String, Error> {
        let mut args = vec!["kubectl", "exec", pod, "-c", container, "-n", namespace, "--"];
        args.extend_from_slice(argv);
        self.runner.capture(&args).await
    }

    /// Start a background port-forward from `local` to `remote` on the pod.
    ///
    /// The forward is usable once a TCP connect to `local` succeeds; callers
    /// own that probe.
    ///
    /// # Errors
    ///
    /// Fails when the kubectl process cannot be spawned.
    pub fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        local: u16,
        remote: u16,
    ) -> Result<ChildProcess, Error> {
        let target = format!("pod/{pod}");
        let mapping = format!("{local}:{remote}");
        let args = [
            "kubectl",
            "port-forward",
            &target,
            &mapping,
            "-n",
            namespace,
        ];
        self.runner.spawn("port-forward", &args)
    }
}

fn append_namespace<'a>(args: &mut Vec<&'a str>, namespace: Option<&'a str>) {
    if let Some(ns) = namespace {
        args.push("-n");
        args.push(ns);
    }
}

/// Render the Service manifest for a created workload.
///
/// `kubectl create deployment` labels pods with `app=<name>`, so the selector
/// matches the deployment's pods.
fn service_manifest(namespace: Option<&str>, name: &str, ports: &[u16]) -> String {
    use std::fmt::Write as _;

    let mut manifest = String::new();
    manifest.push_str("apiVersion: v1\nkind: Service\nmetadata:\n");
    let _ = writeln!(manifest, "  name: {name}");
    if let Some(ns) = namespace {
        let _ = writeln!(manifest, "  namespace: {ns}");
    }
    manifest.push_str("spec:\n  selector:\n");
    let _ = writeln!(manifest, "    app: {name}");
    manifest.push_str("  ports:\n");
    for port in ports {
        let _ = writeln!(manifest, "    - name: port-{port}");
        let _ = writeln!(manifest, "      port: {port}");
        let _ = writeln!(manifest, "      targetPort: {port}");
    }
    manifest
}
