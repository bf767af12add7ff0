//! Compiled execution plan.
//!
//! The Spec provides the required instructions for reproducible pipeline
//! execution: the ordered container steps, the runner-injected internal
//! steps, the volumes and the per-stage network. The Spec exclusively owns
//! the lifecycle of the network and volumes it declares.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::policy::{ErrPolicy, PullPolicy, RunPolicy};

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Spec is the intermediate representation of a compiled stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default)]
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub internal: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub network: Network,
    /// When set, a step may not run while any of its secrets is
    /// unresolved; the engine fails the run with a diagnostic instead.
    #[serde(default, skip_serializing_if = "is_false")]
    pub secrets_required: bool,
}

impl Spec {
    /// Returns the step with the given name, searching main steps only.
    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Step defines a single pipeline step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default, rename = "args", skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cpu_period: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cpu_quota: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cpu_shares: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cpu_set: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub detach: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<VolumeDevice>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(
        default,
        rename = "environment",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub envs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
    #[serde(default)]
    pub err_policy: ErrPolicy,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub mem_limit: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub memswap_limit: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub privileged: bool,
    #[serde(default)]
    pub pull: PullPolicy,
    #[serde(default)]
    pub run_policy: RunPolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<Secret>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub shm_size: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
}

impl Step {
    /// Shallow-clones the step for mutation by the execer, copying the
    /// environment map so the shared Spec is never mutated.
    pub fn clone_for_run(&self) -> Step {
        let mut dst = self.clone();
        dst.envs = self.envs.clone();
        dst
    }

    /// Names of secrets whose value never resolved.
    pub fn missing_secrets(&self) -> Vec<&str> {
        self.secrets
            .iter()
            .filter(|s| s.data.is_empty())
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Secret represents a secret variable bound to a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "bytes_b64")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mask: bool,
}

impl Secret {
    pub fn value(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

// secret bytes serialize as a base64 string, matching the original
// wire form for []byte fields.
mod bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(D::Error::custom)
    }
}

/// Platform defines the target platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Volume that can be mounted by containers. Exactly one of the backing
/// kinds is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default, rename = "temp", skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<VolumeEmptyDir>,
    #[serde(default, rename = "host", skip_serializing_if = "Option::is_none")]
    pub host_path: Option<VolumeHostPath>,
}

/// VolumeEmptyDir mounts a temporary directory from the host node's
/// filesystem into the container, used as shared scratch space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeEmptyDir {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub medium: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size_limit: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// VolumeHostPath mounts a file or directory from the host node's
/// filesystem into the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeHostPath {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
}

/// VolumeMount describes a mounting of a Volume within a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMount {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

/// VolumeDevice describes a mapping of a raw block device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDevice {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, rename = "path", skip_serializing_if = "String::is_empty")]
    pub device_path: String,
}

/// Network that is created and attached to containers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, String>,
}

/// Auth defines registry authentication credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_fields_omitted() {
        let spec = Spec {
            steps: vec![Step {
                name: "build".to_string(),
                image: "golang:1.21".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let out = serde_json::to_string(&spec).unwrap();
        assert!(out.contains("\"name\":\"build\""));
        assert!(!out.contains("depends_on"));
        assert!(!out.contains("privileged"));
        assert!(!out.contains("secrets_required"));
    }

    #[test]
    fn test_policies_marshal_as_tags() {
        let step = Step {
            name: "deploy".to_string(),
            run_policy: RunPolicy::OnFailure,
            err_policy: ErrPolicy::FailFast,
            pull: PullPolicy::Always,
            ..Default::default()
        };
        let out = serde_json::to_value(&step).unwrap();
        assert_eq!(out["run_policy"], "on-failure");
        assert_eq!(out["err_policy"], "fail-fast");
        assert_eq!(out["pull"], "always");
    }

    #[test]
    fn test_secret_data_round_trip() {
        let secret = Secret {
            name: "token".to_string(),
            env: "TOKEN".to_string(),
            data: b"s3cr3t-v4lue".to_vec(),
            mask: true,
        };
        let text = serde_json::to_string(&secret).unwrap();
        let back: Secret = serde_json::from_str(&text).unwrap();
        assert_eq!(back.data, b"s3cr3t-v4lue");
        assert!(back.mask);
    }

    #[test]
    fn test_missing_secrets() {
        let step = Step {
            secrets: vec![
                Secret {
                    name: "found".to_string(),
                    data: b"x".to_vec(),
                    ..Default::default()
                },
                Secret {
                    name: "lost".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(step.missing_secrets(), vec!["lost"]);
    }
}
