//! Pipeline linter.
//!
//! Evaluates the parsed pipeline against a set of safety rules and
//! returns the first violation. Untrusted repositories are denied every
//! feature that reaches the host: privileged mode, devices, dns, hosts,
//! network mode, shm size, host-path and in-memory volumes.

use hodei_runner_core::resource::{Pipeline, Step, VolumeDecl};
use hodei_runner_core::DomainError;
use std::collections::HashSet;

/// Linting options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Opts {
    pub trusted: bool,
}

/// Executes the linting rules for the pipeline configuration.
pub fn lint(pipeline: &Pipeline, opts: Opts) -> Result<(), DomainError> {
    check_steps(pipeline, opts.trusted)?;
    check_volumes(pipeline, opts.trusted)?;
    Ok(())
}

fn check_steps(pipeline: &Pipeline, trusted: bool) -> Result<(), DomainError> {
    let mut names: HashSet<&str> = HashSet::new();
    if !pipeline.clone.disable {
        names.insert("clone");
    }
    for step in pipeline.services.iter().chain(pipeline.steps.iter()) {
        if !names.insert(&step.name) {
            return Err(lint_error("duplicate step names"));
        }
        check_step(step, trusted)?;
        check_deps(step, &names)?;
    }
    Ok(())
}

fn check_step(step: &Step, trusted: bool) -> Result<(), DomainError> {
    if step.image.is_empty() {
        return Err(lint_error("invalid or missing image"));
    }
    if !trusted && step.privileged {
        return Err(lint_error(
            "untrusted repositories cannot enable privileged mode",
        ));
    }
    if !trusted && !step.devices.is_empty() {
        return Err(lint_error("untrusted repositories cannot mount devices"));
    }
    if !trusted && !step.dns.is_empty() {
        return Err(lint_error("untrusted repositories cannot configure dns"));
    }
    if !trusted && !step.dns_search.is_empty() {
        return Err(lint_error(
            "untrusted repositories cannot configure dns_search",
        ));
    }
    if !trusted && !step.extra_hosts.is_empty() {
        return Err(lint_error(
            "untrusted repositories cannot configure extra_hosts",
        ));
    }
    if !trusted && !step.network_mode.is_empty() {
        return Err(lint_error(
            "untrusted repositories cannot configure network_mode",
        ));
    }
    if !trusted && step.shm_size > 0 {
        return Err(lint_error(
            "untrusted repositories cannot configure shm_size",
        ));
    }
    for mount in &step.volumes {
        match mount.name.as_str() {
            "workspace" | "_workspace" | "_docker_socket" => {
                return Err(lint_error(format!("invalid volume name: {}", mount.name)));
            }
            _ => {}
        }
        if clean_path(&mount.path).starts_with("/run/drone") {
            return Err(lint_error("cannot mount volume at /run/drone"));
        }
    }
    Ok(())
}

fn check_volumes(pipeline: &Pipeline, trusted: bool) -> Result<(), DomainError> {
    for volume in &pipeline.volumes {
        if volume.host_path.is_some() && !trusted {
            return Err(lint_error(
                "untrusted repositories cannot mount host volumes",
            ));
        }
        if let Some(empty_dir) = &volume.empty_dir {
            if empty_dir.medium == "memory" && !trusted {
                return Err(lint_error(
                    "untrusted repositories cannot mount in-memory volumes",
                ));
            }
        }
        check_volume_decl(volume)?;
    }
    Ok(())
}

fn check_volume_decl(volume: &VolumeDecl) -> Result<(), DomainError> {
    match volume.name.as_str() {
        "" => return Err(lint_error("missing volume name")),
        "workspace" | "_workspace" | "_docker_socket" => {
            return Err(lint_error(format!("invalid volume name: {}", volume.name)));
        }
        _ => {}
    }
    match (&volume.empty_dir, &volume.host_path) {
        (Some(_), Some(_)) => Err(lint_error(format!(
            "volume has multiple backing kinds: {}",
            volume.name
        ))),
        (None, None) => Err(lint_error(format!(
            "volume has no backing kind: {}",
            volume.name
        ))),
        _ => Ok(()),
    }
}

fn check_deps(step: &Step, defined: &HashSet<&str>) -> Result<(), DomainError> {
    for dep in &step.depends_on {
        if step.name == *dep {
            return Err(lint_error(format!(
                "cyclical step dependency detected: {dep}"
            )));
        }
        if !defined.contains(dep.as_str()) {
            return Err(lint_error(format!(
                "unknown step dependency detected: {} references {}",
                step.name, dep
            )));
        }
    }
    Ok(())
}

fn lint_error(msg: impl Into<String>) -> DomainError {
    DomainError::Lint(msg.into())
}

// lexically normalizes the path, resolving `.` and `..` segments the way
// filepath.Clean does.
fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() && !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hodei_runner_core::resource::{EmptyDirDecl, HostPathDecl, MountDecl};

    fn step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            image: "alpine".to_string(),
            ..Default::default()
        }
    }

    fn pipeline_with_steps(steps: Vec<Step>) -> Pipeline {
        Pipeline {
            steps,
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_image() {
        let mut s = step("a");
        s.image = String::new();
        let err = lint(&pipeline_with_steps(vec![s]), Opts::default()).unwrap_err();
        assert_eq!(err.to_string(), "linter: invalid or missing image");
    }

    #[test]
    fn test_duplicate_step_names() {
        let err = lint(
            &pipeline_with_steps(vec![step("a"), step("a")]),
            Opts::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "linter: duplicate step names");
    }

    #[test]
    fn test_clone_name_is_reserved() {
        let err = lint(&pipeline_with_steps(vec![step("clone")]), Opts::default()).unwrap_err();
        assert_eq!(err.to_string(), "linter: duplicate step names");

        // allowed when cloning is disabled
        let mut pipeline = pipeline_with_steps(vec![step("clone")]);
        pipeline.clone.disable = true;
        assert!(lint(&pipeline, Opts::default()).is_ok());
    }

    #[test]
    fn test_untrusted_privileged() {
        let mut s = step("a");
        s.privileged = true;
        let err = lint(&pipeline_with_steps(vec![s.clone()]), Opts::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "linter: untrusted repositories cannot enable privileged mode"
        );
        assert!(lint(&pipeline_with_steps(vec![s]), Opts { trusted: true }).is_ok());
    }

    #[test]
    fn test_untrusted_host_volume() {
        let mut pipeline = pipeline_with_steps(vec![step("a")]);
        pipeline.volumes.push(VolumeDecl {
            name: "docker".to_string(),
            host_path: Some(HostPathDecl {
                path: "/var/run/docker.sock".to_string(),
            }),
            ..Default::default()
        });
        let err = lint(&pipeline, Opts::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "linter: untrusted repositories cannot mount host volumes"
        );
        assert!(lint(&pipeline, Opts { trusted: true }).is_ok());
    }

    #[test]
    fn test_untrusted_memory_volume() {
        let mut pipeline = pipeline_with_steps(vec![step("a")]);
        pipeline.volumes.push(VolumeDecl {
            name: "tmp".to_string(),
            empty_dir: Some(EmptyDirDecl {
                medium: "memory".to_string(),
                size_limit: 0,
            }),
            ..Default::default()
        });
        let err = lint(&pipeline, Opts::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "linter: untrusted repositories cannot mount in-memory volumes"
        );
    }

    #[test]
    fn test_reserved_volume_names() {
        let mut pipeline = pipeline_with_steps(vec![step("a")]);
        pipeline.volumes.push(VolumeDecl {
            name: "_docker_socket".to_string(),
            empty_dir: Some(EmptyDirDecl::default()),
            ..Default::default()
        });
        let err = lint(&pipeline, Opts { trusted: true }).unwrap_err();
        assert_eq!(err.to_string(), "linter: invalid volume name: _docker_socket");
    }

    #[test]
    fn test_reserved_mount_path() {
        let mut s = step("a");
        s.volumes.push(MountDecl {
            name: "cache".to_string(),
            path: "/run/drone/../drone/env".to_string(),
        });
        let err = lint(&pipeline_with_steps(vec![s]), Opts { trusted: true }).unwrap_err();
        assert_eq!(err.to_string(), "linter: cannot mount volume at /run/drone");
    }

    #[test]
    fn test_unknown_and_self_dependency() {
        let mut s = step("b");
        s.depends_on.push("missing".to_string());
        let err = lint(&pipeline_with_steps(vec![step("a"), s]), Opts::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "linter: unknown step dependency detected: b references missing"
        );

        let mut s = step("b");
        s.depends_on.push("b".to_string());
        let err = lint(&pipeline_with_steps(vec![s]), Opts::default()).unwrap_err();
        assert_eq!(err.to_string(), "linter: cyclical step dependency detected: b");
    }

    #[test]
    fn test_volume_backing_kinds() {
        let mut pipeline = pipeline_with_steps(vec![step("a")]);
        pipeline.volumes.push(VolumeDecl {
            name: "both".to_string(),
            empty_dir: Some(EmptyDirDecl::default()),
            host_path: Some(HostPathDecl::default()),
        });
        assert!(lint(&pipeline, Opts { trusted: true }).is_err());

        pipeline.volumes[0] = VolumeDecl {
            name: "neither".to_string(),
            ..Default::default()
        };
        assert!(lint(&pipeline, Opts { trusted: true }).is_err());
    }

    #[test]
    fn test_dependency_on_clone() {
        let mut s = step("a");
        s.depends_on.push("clone".to_string());
        assert!(lint(&pipeline_with_steps(vec![s]), Opts::default()).is_ok());
    }
}
