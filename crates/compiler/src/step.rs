//! Per-step lowering.
//!
//! Converts a parsed resource step into a compiled engine step: resolved
//! image, static environment, secret references, plugin settings, mounts,
//! devices and the run/err policies derived from `when` and `failure`.

use std::collections::HashMap;

use hodei_runner_core::image;
use hodei_runner_core::resource::{EnvValue, SettingsValue, Step as ResourceStep};
use hodei_runner_core::spec::{Secret, Step, VolumeDevice, VolumeMount};
use hodei_runner_core::{ErrPolicy, PullPolicy, RunPolicy};

/// Converts the resource step into its compiled form. The caller layers
/// the stage environment, mounts and labels afterwards.
pub fn create_step(src: &ResourceStep, id: String) -> Step {
    let mut dst = Step {
        id,
        name: src.name.clone(),
        image: image::expand(&src.image),
        command: src.command.clone(),
        entrypoint: src.entrypoint.clone(),
        detach: src.detach,
        depends_on: src.depends_on.clone(),
        dns: src.dns.clone(),
        dns_search: src.dns_search.clone(),
        envs: convert_static_env(&src.environment),
        extra_hosts: src.extra_hosts.clone(),
        network: src.network_mode.clone(),
        privileged: src.privileged,
        pull: PullPolicy::from_tag(&src.pull),
        user: src.user.clone(),
        secrets: convert_secret_env(&src.environment),
        shm_size: src.shm_size,
        working_dir: src.working_dir.clone(),
        ..Default::default()
    };

    if src.mem_limit > 0 {
        dst.mem_limit = src.mem_limit;
    }
    if src.memswap_limit > 0 {
        dst.memswap_limit = src.memswap_limit;
    }

    for vol in &src.volumes {
        dst.volumes.push(VolumeMount {
            name: vol.name.clone(),
            path: vol.path.clone(),
        });
    }

    for device in &src.devices {
        dst.devices.push(VolumeDevice {
            name: device.name.clone(),
            device_path: device.path.clone(),
        });
    }

    // all settings are passed to the plugin as environment variables
    // prefixed with PLUGIN_; secret-sourced settings become secret refs.
    for (key, value) in &src.settings {
        let key = format!("PLUGIN_{}", key.to_uppercase());
        match value {
            SettingsValue::Secret { from_secret } => dst.secrets.push(Secret {
                name: from_secret.clone(),
                env: key,
                mask: true,
                ..Default::default()
            }),
            other => {
                dst.envs.insert(key, encode(other));
            }
        }
    }

    // steps run on success by default, but may be configured to run on
    // failure or always through the when.status condition.
    if is_run_always(src) {
        dst.run_policy = RunPolicy::Always;
    } else if is_run_on_failure(src) {
        dst.run_policy = RunPolicy::OnFailure;
    }

    dst.err_policy = ErrPolicy::from_tag(&src.failure);

    dst
}

fn convert_static_env(environment: &HashMap<String, EnvValue>) -> HashMap<String, String> {
    environment
        .iter()
        .filter_map(|(k, v)| match v {
            EnvValue::Literal(value) => Some((k.clone(), value.clone())),
            EnvValue::Secret { .. } => None,
        })
        .collect()
}

fn convert_secret_env(environment: &HashMap<String, EnvValue>) -> Vec<Secret> {
    let mut secrets: Vec<Secret> = environment
        .iter()
        .filter_map(|(k, v)| match v {
            EnvValue::Secret { from_secret } => Some(Secret {
                name: from_secret.clone(),
                env: k.clone(),
                mask: true,
                ..Default::default()
            }),
            EnvValue::Literal(_) => None,
        })
        .collect();
    secrets.sort_by(|a, b| a.env.cmp(&b.env));
    secrets
}

fn is_run_always(src: &ResourceStep) -> bool {
    let status = &src.when.status;
    if status.include.is_empty() && status.exclude.is_empty() {
        return false;
    }
    status.matches("failure") && status.matches("success")
}

fn is_run_on_failure(src: &ResourceStep) -> bool {
    let status = &src.when.status;
    if status.include.is_empty() && status.exclude.is_empty() {
        return false;
    }
    status.matches("failure")
}

/// Encodes a settings value as the string form the plugin convention
/// expects: scalars verbatim, lists comma-separated, maps as JSON.
pub fn encode(value: &SettingsValue) -> String {
    match value {
        SettingsValue::Bool(v) => v.to_string(),
        SettingsValue::Int(v) => v.to_string(),
        SettingsValue::Float(v) => v.to_string(),
        SettingsValue::Text(v) => v.clone(),
        SettingsValue::List(items) => items
            .iter()
            .map(encode)
            .collect::<Vec<_>>()
            .join(","),
        SettingsValue::Map(entries) => {
            let map: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect();
            serde_json::Value::Object(map).to_string()
        }
        SettingsValue::Secret { .. } => String::new(),
    }
}

fn to_json(value: &SettingsValue) -> serde_json::Value {
    match value {
        SettingsValue::Bool(v) => serde_json::Value::from(*v),
        SettingsValue::Int(v) => serde_json::Value::from(*v),
        SettingsValue::Float(v) => serde_json::Value::from(*v),
        SettingsValue::Text(v) => serde_json::Value::from(v.clone()),
        SettingsValue::List(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect())
        }
        SettingsValue::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
        SettingsValue::Secret { .. } => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hodei_runner_core::resource::Constraint;

    #[test]
    fn test_create_step_basics() {
        let mut src = ResourceStep {
            name: "build".to_string(),
            image: "golang:1.21".to_string(),
            ..Default::default()
        };
        src.environment.insert(
            "GOOS".to_string(),
            EnvValue::Literal("linux".to_string()),
        );
        src.environment.insert(
            "TOKEN".to_string(),
            EnvValue::Secret {
                from_secret: "api_token".to_string(),
            },
        );
        let dst = create_step(&src, "hodei-1".to_string());
        assert_eq!(dst.image, "docker.io/library/golang:1.21");
        assert_eq!(dst.envs["GOOS"], "linux");
        assert_eq!(dst.secrets.len(), 1);
        assert_eq!(dst.secrets[0].name, "api_token");
        assert_eq!(dst.secrets[0].env, "TOKEN");
        assert!(dst.secrets[0].mask);
        assert_eq!(dst.run_policy, RunPolicy::OnSuccess);
        assert_eq!(dst.err_policy, ErrPolicy::Fail);
    }

    #[test]
    fn test_settings_become_plugin_envs() {
        let mut src = ResourceStep {
            name: "publish".to_string(),
            image: "plugins/docker".to_string(),
            ..Default::default()
        };
        src.settings.insert(
            "repo".to_string(),
            SettingsValue::Text("octocat/app".to_string()),
        );
        src.settings.insert(
            "tags".to_string(),
            SettingsValue::List(vec![
                SettingsValue::Text("latest".to_string()),
                SettingsValue::Int(2),
            ]),
        );
        src.settings.insert(
            "password".to_string(),
            SettingsValue::Secret {
                from_secret: "docker_password".to_string(),
            },
        );
        let dst = create_step(&src, "hodei-2".to_string());
        assert_eq!(dst.envs["PLUGIN_REPO"], "octocat/app");
        assert_eq!(dst.envs["PLUGIN_TAGS"], "latest,2");
        assert!(dst
            .secrets
            .iter()
            .any(|s| s.env == "PLUGIN_PASSWORD" && s.name == "docker_password"));
    }

    #[test]
    fn test_when_status_drives_run_policy() {
        let mut src = ResourceStep {
            name: "notify".to_string(),
            image: "plugins/slack".to_string(),
            ..Default::default()
        };
        src.when.status = Constraint {
            include: vec!["failure".to_string()],
            exclude: vec![],
        };
        assert_eq!(
            create_step(&src, "id".to_string()).run_policy,
            RunPolicy::OnFailure
        );

        src.when.status.include.push("success".to_string());
        assert_eq!(
            create_step(&src, "id".to_string()).run_policy,
            RunPolicy::Always
        );
    }

    #[test]
    fn test_failure_policy() {
        let src = ResourceStep {
            name: "unit".to_string(),
            image: "golang".to_string(),
            failure: "ignore".to_string(),
            ..Default::default()
        };
        assert_eq!(
            create_step(&src, "id".to_string()).err_policy,
            ErrPolicy::Ignore
        );
    }
}
