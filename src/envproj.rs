//! Projecting a pod's environment into the local shell.
//!
//! Only three families of variables survive the projection: the synthetic
//! pod identity pair, variables declared on the companion container in the
//! workload spec, and the orchestrator's service-discovery families. Values
//! are copied verbatim; cluster-internal addresses stay valid because the
//! shell dials through the SOCKS tunnel.

use std::collections::BTreeMap;

/// Synthetic variable naming the proxied pod.
pub const POD_VAR: &str = "TELEPRESENCE_POD";

/// Synthetic variable naming the companion container.
pub const CONTAINER_VAR: &str = "TELEPRESENCE_CONTAINER";

const SERVICE_HOST_SUFFIX: &str = "_SERVICE_HOST";
const SERVICE_SUFFIXES: [&str; 5] = ["_ADDR", "_PORT", "_PROTO", "_HOST", "_TCP"];

/// Environment observed inside the pod. Sorted by construction, immutable
/// once captured.
pub type PodEnv = BTreeMap<String, String>;

/// Parse the output of running `env` inside the pod.
///
/// Continuation lines of multi-line values carry no `=` and are skipped.
#[must_use]
pub fn parse_pod_env(raw: &str) -> PodEnv {
    raw.lines()
        .filter_map(|line| {
            line.split_once('=')
                .map(|(name, value)| (name.to_string(), value.to_string()))
        })
        .collect()
}

/// Service keys present in the environment, in canonical (lexicographic)
/// order. This order must match the order the in-pod forwarder assigns
/// tunnel slots, so it is derived the same way every time.
#[must_use]
pub fn service_keys(env: &PodEnv) -> Vec<String> {
    env.keys()
        .filter_map(|name| name.strip_suffix(SERVICE_HOST_SUFFIX))
        .map(str::to_string)
        .collect()
}

/// Apply the projection rules.
///
/// A variable survives iff it is one of the two synthetic identifiers, is
/// named in `declared`, or belongs to a service-discovery family
/// (`<key>_…{_ADDR,_PORT,_PROTO,_HOST,_TCP}`). Re-running on the same inputs
/// yields an identical map.
#[must_use]
pub fn project(
    env: &PodEnv,
    declared: &[String],
    pod_name: &str,
    container_name: &str,
) -> BTreeMap<String, String> {
    let keys = service_keys(env);

    let mut projected = BTreeMap::new();
    projected.insert(POD_VAR.to_string(), pod_name.to_string());
    projected.insert(CONTAINER_VAR.to_string(), container_name.to_string());

    for (name, value) in env {
        let is_declared = declared.iter().any(|d| d == name);
        let is_service = keys.iter().any(|key| {
            name.len() > key.len()
                && name.starts_with(key)
                && name.as_bytes()[key.len()] == b'_'
                && SERVICE_SUFFIXES
                    .iter()
                    .any(|suffix| name.ends_with(suffix))
        });
        if is_declared || is_service {
            projected.insert(name.clone(), value.clone());
        }
    }
    projected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> PodEnv {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_skips_lines_without_equals() {
        let parsed = parse_pod_env("FOO=1\njunk line\nBAR=a=b\n");
        assert_eq!(parsed.get("FOO").unwrap(), "1");
        assert_eq!(parsed.get("BAR").unwrap(), "a=b");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_service_keys_are_sorted() {
        let pod_env = env(&[
            ("ZULU_SERVICE_HOST", "10.0.0.3"),
            ("API_SERVICE_HOST", "10.0.0.1"),
            ("MID_SERVICE_HOST", "10.0.0.2"),
            ("UNRELATED", "x"),
        ]);
        assert_eq!(service_keys(&pod_env), vec!["API", "MID", "ZULU"]);
    }

    #[test]
    fn test_projection_keeps_declared_and_service_families_only() {
        let pod_env = env(&[
            ("FOO", "1"),
            ("BAR", "2"),
            ("API_SERVICE_HOST", "10.0.0.1"),
            ("API_SERVICE_PORT", "80"),
            ("API_PORT_80_TCP_ADDR", "10.0.0.1"),
            ("OTHER", "x"),
        ]);
        let declared = vec!["BAR".to_string()];
        let projected = project(&pod_env, &declared, "web-abc12", "web");

        assert_eq!(projected.get("BAR").unwrap(), "2");
        assert_eq!(projected.get("API_SERVICE_HOST").unwrap(), "10.0.0.1");
        assert_eq!(projected.get("API_SERVICE_PORT").unwrap(), "80");
        assert_eq!(projected.get("API_PORT_80_TCP_ADDR").unwrap(), "10.0.0.1");
        assert!(!projected.contains_key("FOO"));
        assert!(!projected.contains_key("OTHER"));
    }

    #[test]
    fn test_projection_emits_synthetic_identity() {
        let projected = project(&PodEnv::new(), &[], "web-abc12", "web");
        assert_eq!(projected.get(POD_VAR).unwrap(), "web-abc12");
        assert_eq!(projected.get(CONTAINER_VAR).unwrap(), "web");
        assert_eq!(projected.len(), 2);
    }

    #[test]
    fn test_bare_tcp_suffix_is_a_service_variable() {
        let pod_env = env(&[
            ("API_SERVICE_HOST", "10.0.0.1"),
            ("API_PORT_80_TCP", "tcp://10.0.0.1:80"),
            ("API_PORT_80_TCP_PROTO", "tcp"),
        ]);
        let projected = project(&pod_env, &[], "p", "c");
        assert!(projected.contains_key("API_PORT_80_TCP"));
        assert!(projected.contains_key("API_PORT_80_TCP_PROTO"));
    }

    #[test]
    fn test_prefix_match_requires_key_boundary() {
        // APIX_… must not ride along on service key API
        let pod_env = env(&[
            ("API_SERVICE_HOST", "10.0.0.1"),
            ("APIX_PORT", "nope"),
        ]);
        let projected = project(&pod_env, &[], "p", "c");
        assert!(!projected.contains_key("APIX_PORT"));
    }

    #[test]
    fn test_projection_is_deterministic() {
        let pod_env = env(&[
            ("B_SERVICE_HOST", "2"),
            ("A_SERVICE_HOST", "1"),
            ("A_SERVICE_PORT", "80"),
        ]);
        let first = project(&pod_env, &[], "p", "c");
        let second = project(&pod_env, &[], "p", "c");
        assert_eq!(first, second);
        let rendered: Vec<String> = first.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let rendered_again: Vec<String> =
            second.iter().map(|(k, v)| format!("{k}={v}")).collect();
        assert_eq!(rendered, rendered_again);
    }
}
