//! Locating the proxy pod behind a workload.
//!
//! Given a deployment, find the one pod that belongs to it, identify the
//! companion container inside, check the image version against our own, and
//! wait for the pod to report ready.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::config::COMPANION_IMAGE_NAME;
use crate::error::Error;
use crate::kubectl::{Container, Kubectl, Pod, Workload};

const READY_ATTEMPTS: u32 = 120;
const READY_INTERVAL: Duration = Duration::from_secs(1);

/// The resolved proxy pod. Valid only while the pod stays non-terminal.
#[derive(Debug, Clone)]
pub struct PodRef {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
    /// Tag of the companion image, already verified to equal the tool
    /// version; retained so the session can report what it attached to.
    pub companion_image_tag: String,
}

/// Resolve the proxy pod for `workload` and wait for it to become ready.
///
/// # Errors
///
/// - [`Error::PodNotFound`] when no pod matches the workload.
/// - [`Error::VersionMismatch`] when the companion image tag differs from
///   `local_version`.
/// - [`Error::PodNotReady`] when the pod stays unready past the budget.
pub async fn resolve(
    kubectl: &Kubectl,
    workload_spec: &Workload,
    caller_namespace: Option<&str>,
    workload: &str,
    local_version: &str,
) -> Result<PodRef, Error> {
    let expected_labels = &workload_spec.spec.template.metadata.labels;
    let namespace = effective_namespace(workload_spec, caller_namespace);

    let pods = kubectl.list_pods(&namespace).await?;
    let pod = select_pod(&pods, workload, expected_labels, &namespace).ok_or_else(|| {
        Error::PodNotFound {
            workload: workload.to_string(),
        }
    })?;

    let (container, tag) =
        find_companion(&pod.spec.containers).ok_or_else(|| Error::PodNotFound {
            workload: workload.to_string(),
        })?;
    if tag != local_version {
        return Err(Error::VersionMismatch {
            local: local_version.to_string(),
            remote: tag,
        });
    }

    let pod_ref = PodRef {
        namespace: namespace.clone(),
        pod_name: pod.metadata.name.clone(),
        container_name: container.name.clone(),
        companion_image_tag: local_version.to_string(),
    };
    debug!(pod = %pod_ref.pod_name, container = %pod_ref.container_name, "selected proxy pod");

    wait_until_ready(kubectl, &pod_ref).await?;
    Ok(pod_ref)
}

/// Spec-declared namespace, else the caller's, else `default`.
fn effective_namespace(workload_spec: &Workload, caller: Option<&str>) -> String {
    workload_spec
        .metadata
        .namespace
        .clone()
        .or_else(|| caller.map(str::to_string))
        .unwrap_or_else(|| "default".to_string())
}

/// True when `pod_labels` carries every expected label with the same value.
fn labels_match(
    pod_labels: &BTreeMap<String, String>,
    expected: &BTreeMap<String, String>,
) -> bool {
    expected.iter().all(|(k, v)| pod_labels.get(k) == Some(v))
}

/// Pick the pod that belongs to the workload: label superset, name prefixed
/// with `<workload>-`, matching namespace, non-terminal phase.
fn select_pod<'a>(
    pods: &'a [Pod],
    workload: &str,
    expected_labels: &BTreeMap<String, String>,
    namespace: &str,
) -> Option<&'a Pod> {
    let prefix = format!("{workload}-");
    pods.iter().find(|pod| {
        pod.metadata.name.starts_with(&prefix)
            && labels_match(&pod.metadata.labels, expected_labels)
            && pod.metadata.namespace.as_deref().unwrap_or(namespace) == namespace
            && matches!(pod.status.phase.as_str(), "Pending" | "Running")
    })
}

/// The container running the companion image, with its image tag.
fn find_companion(containers: &[Container]) -> Option<(&Container, String)> {
    containers
        .iter()
        .find(|c| c.image.contains(COMPANION_IMAGE_NAME))
        .map(|c| (c, image_tag(&c.image)))
}

/// Substring after the final `:` of an image reference; empty if untagged.
fn image_tag(image: &str) -> String {
    image
        .rfind(':')
        .map(|idx| image[idx + 1..].to_string())
        .unwrap_or_default()
}

/// Poll the pod until it is Running and the companion container is ready.
async fn wait_until_ready(kubectl: &Kubectl, pod: &PodRef) -> Result<(), Error> {
    for attempt in 0..READY_ATTEMPTS {
        // a failed read inside the poll budget is just "not ready yet"
        if let Ok(current) = kubectl.get_pod(&pod.namespace, &pod.pod_name).await {
            if current.status.phase == "Running"
                && current
                    .status
                    .container_statuses
                    .iter()
                    .any(|cs| cs.name == pod.container_name && cs.ready)
            {
                debug!(pod = %pod.pod_name, attempt, "pod is ready");
                return Ok(());
            }
        }
        sleep(READY_INTERVAL).await;
    }
    Err(Error::PodNotReady {
        pod: pod.pod_name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubectl::{ObjectMeta, PodSpec, PodStatus};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pod(name: &str, ns: &str, lbls: &[(&str, &str)], phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some(ns.to_string()),
                labels: labels(lbls),
            },
            spec: PodSpec { containers: vec![] },
            status: PodStatus {
                phase: phase.to_string(),
                container_statuses: vec![],
            },
        }
    }

    #[test]
    fn test_select_pod_requires_label_superset() {
        let pods = vec![
            pod("web-aaaaa", "default", &[("app", "other")], "Running"),
            pod(
                "web-bbbbb",
                "default",
                &[("app", "web"), ("extra", "yes")],
                "Running",
            ),
        ];
        let expected = labels(&[("app", "web")]);
        let found = select_pod(&pods, "web", &expected, "default").unwrap();
        assert_eq!(found.metadata.name, "web-bbbbb");
    }

    #[test]
    fn test_select_pod_requires_name_prefix() {
        let pods = vec![pod("webserver-aaaaa", "default", &[], "Running")];
        assert!(select_pod(&pods, "web", &BTreeMap::new(), "default").is_none());

        let pods = vec![pod("web-aaaaa", "default", &[], "Running")];
        assert!(select_pod(&pods, "web", &BTreeMap::new(), "default").is_some());
    }

    #[test]
    fn test_select_pod_skips_terminal_phases() {
        let pods = vec![
            pod("web-aaaaa", "default", &[], "Succeeded"),
            pod("web-bbbbb", "default", &[], "Failed"),
            pod("web-ccccc", "default", &[], "Pending"),
        ];
        let found = select_pod(&pods, "web", &BTreeMap::new(), "default").unwrap();
        assert_eq!(found.metadata.name, "web-ccccc");
    }

    #[test]
    fn test_select_pod_requires_matching_namespace() {
        let pods = vec![pod("web-aaaaa", "other", &[], "Running")];
        assert!(select_pod(&pods, "web", &BTreeMap::new(), "default").is_none());
    }

    #[test]
    fn test_find_companion_by_image_token() {
        let containers = vec![
            Container {
                name: "app".into(),
                image: "example/app:1.0".into(),
                env: vec![],
            },
            Container {
                name: "proxy".into(),
                image: "datawire/telepresence-k8s:0.26".into(),
                env: vec![],
            },
        ];
        let (container, tag) = find_companion(&containers).unwrap();
        assert_eq!(container.name, "proxy");
        assert_eq!(tag, "0.26");
    }

    #[test]
    fn test_image_tag_extraction() {
        assert_eq!(image_tag("datawire/telepresence-k8s:0.26"), "0.26");
        assert_eq!(image_tag("telepresence-k8s"), "");
    }

    #[test]
    fn test_effective_namespace_precedence() {
        let mut workload = Workload {
            metadata: ObjectMeta {
                name: "web".into(),
                namespace: Some("spec-ns".into()),
                labels: BTreeMap::new(),
            },
            spec: Default::default(),
        };
        assert_eq!(effective_namespace(&workload, Some("flag-ns")), "spec-ns");

        workload.metadata.namespace = None;
        assert_eq!(effective_namespace(&workload, Some("flag-ns")), "flag-ns");
        assert_eq!(effective_namespace(&workload, None), "default");
    }
}
