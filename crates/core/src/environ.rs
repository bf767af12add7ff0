//! Environment variable derivation.
//!
//! Helper functions that derive the well-known `DRONE_*` environment
//! variables from the coordinator records. The compiler layers these maps
//! in a fixed precedence order; later maps win.

use std::collections::HashMap;

use crate::model::{Build, Netrc, Repo, Stage, StageStep, System};

/// Combines environment maps left to right; later entries override
/// earlier ones. Empty values are dropped.
pub fn combine(maps: &[&HashMap<String, String>]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for map in maps {
        for (k, v) in map.iter() {
            out.insert(k.clone(), v.clone());
        }
    }
    out.retain(|_, v| !v.is_empty());
    out
}

pub fn build(build: &Build) -> HashMap<String, String> {
    let mut envs = HashMap::from([
        ("CI".to_string(), "true".to_string()),
        ("DRONE".to_string(), "true".to_string()),
        ("DRONE_BUILD_NUMBER".to_string(), build.number.to_string()),
        ("DRONE_BUILD_PARENT".to_string(), build.parent.to_string()),
        ("DRONE_BUILD_STATUS".to_string(), build.status.clone()),
        ("DRONE_BUILD_EVENT".to_string(), build.event.clone()),
        ("DRONE_BUILD_ACTION".to_string(), build.action.clone()),
        ("DRONE_BUILD_LINK".to_string(), build.link.clone()),
        ("DRONE_BUILD_CREATED".to_string(), build.created.to_string()),
        ("DRONE_BUILD_STARTED".to_string(), build.started.to_string()),
        (
            "DRONE_BUILD_FINISHED".to_string(),
            build.finished.to_string(),
        ),
        ("DRONE_BRANCH".to_string(), build.target.clone()),
        ("DRONE_SOURCE_BRANCH".to_string(), build.source.clone()),
        ("DRONE_TARGET_BRANCH".to_string(), build.target.clone()),
        ("DRONE_COMMIT".to_string(), build.after.clone()),
        ("DRONE_COMMIT_SHA".to_string(), build.after.clone()),
        ("DRONE_COMMIT_BEFORE".to_string(), build.before.clone()),
        ("DRONE_COMMIT_AFTER".to_string(), build.after.clone()),
        ("DRONE_COMMIT_REF".to_string(), build.git_ref.clone()),
        ("DRONE_COMMIT_BRANCH".to_string(), build.target.clone()),
        ("DRONE_COMMIT_LINK".to_string(), build.link.clone()),
        ("DRONE_COMMIT_MESSAGE".to_string(), build.message.clone()),
        ("DRONE_COMMIT_AUTHOR".to_string(), build.author_login.clone()),
        (
            "DRONE_COMMIT_AUTHOR_NAME".to_string(),
            build.author_name.clone(),
        ),
        (
            "DRONE_COMMIT_AUTHOR_EMAIL".to_string(),
            build.author_email.clone(),
        ),
        (
            "DRONE_COMMIT_AUTHOR_AVATAR".to_string(),
            build.author_avatar.clone(),
        ),
        ("DRONE_DEPLOY_TO".to_string(), build.deploy_to.clone()),
        ("DRONE_CALVER".to_string(), String::new()),
        ("DRONE_SEMVER".to_string(), String::new()),
    ]);
    if build.event == "tag" {
        envs.insert(
            "DRONE_TAG".to_string(),
            build
                .git_ref
                .strip_prefix("refs/tags/")
                .unwrap_or(&build.git_ref)
                .to_string(),
        );
    }
    if build.event == "pull_request" {
        envs.insert(
            "DRONE_PULL_REQUEST".to_string(),
            build
                .git_ref
                .split('/')
                .nth(2)
                .unwrap_or_default()
                .to_string(),
        );
        envs.insert(
            "DRONE_PULL_REQUEST_TITLE".to_string(),
            build.title.clone(),
        );
    }
    envs.insert(
        "DRONE_BUILD_TRIGGER".to_string(),
        build.sender.clone(),
    );
    envs
}

pub fn repo(repo: &Repo) -> HashMap<String, String> {
    HashMap::from([
        ("DRONE_REPO".to_string(), repo.slug.clone()),
        ("DRONE_REPO_OWNER".to_string(), repo.namespace.clone()),
        ("DRONE_REPO_NAMESPACE".to_string(), repo.namespace.clone()),
        ("DRONE_REPO_NAME".to_string(), repo.name.clone()),
        ("DRONE_REPO_LINK".to_string(), repo.link.clone()),
        ("DRONE_REPO_BRANCH".to_string(), repo.branch.clone()),
        ("DRONE_REMOTE_URL".to_string(), repo.http_url.clone()),
        ("DRONE_GIT_HTTP_URL".to_string(), repo.http_url.clone()),
        ("DRONE_GIT_SSH_URL".to_string(), repo.ssh_url.clone()),
        ("DRONE_REPO_PRIVATE".to_string(), repo.private.to_string()),
        ("DRONE_REPO_TRUSTED".to_string(), repo.trusted.to_string()),
    ])
}

pub fn stage(stage: &Stage) -> HashMap<String, String> {
    HashMap::from([
        ("DRONE_STAGE_KIND".to_string(), stage.kind.clone()),
        ("DRONE_STAGE_TYPE".to_string(), stage.stage_type.clone()),
        ("DRONE_STAGE_NAME".to_string(), stage.name.clone()),
        ("DRONE_STAGE_NUMBER".to_string(), stage.number.to_string()),
        ("DRONE_STAGE_MACHINE".to_string(), stage.machine.clone()),
        ("DRONE_STAGE_OS".to_string(), stage.os.clone()),
        ("DRONE_STAGE_ARCH".to_string(), stage.arch.clone()),
        ("DRONE_STAGE_VARIANT".to_string(), stage.variant.clone()),
        ("DRONE_STAGE_STATUS".to_string(), stage.status.clone()),
        ("DRONE_STAGE_STARTED".to_string(), stage.started.to_string()),
        ("DRONE_STAGE_FINISHED".to_string(), stage.stopped.to_string()),
    ])
}

pub fn step(step: &StageStep) -> HashMap<String, String> {
    HashMap::from([
        ("DRONE_STEP_NAME".to_string(), step.name.clone()),
        ("DRONE_STEP_NUMBER".to_string(), step.number.to_string()),
    ])
}

pub fn system(system: &System) -> HashMap<String, String> {
    HashMap::from([
        ("DRONE_SYSTEM_PROTO".to_string(), system.proto.clone()),
        ("DRONE_SYSTEM_HOST".to_string(), system.host.clone()),
        ("DRONE_SYSTEM_HOSTNAME".to_string(), system.host.clone()),
        ("DRONE_SYSTEM_VERSION".to_string(), system.version.clone()),
    ])
}

/// Deep link to the build on the coordinator.
pub fn link(repo: &Repo, build: &Build, system: &System) -> HashMap<String, String> {
    if system.host.is_empty() {
        return HashMap::new();
    }
    let link = format!(
        "{}://{}/{}/{}",
        system.proto, system.host, repo.slug, build.number
    );
    HashMap::from([("DRONE_BUILD_LINK".to_string(), link)])
}

pub fn netrc(netrc: &Netrc) -> HashMap<String, String> {
    if netrc.machine.is_empty() {
        return HashMap::new();
    }
    HashMap::from([
        ("DRONE_NETRC_MACHINE".to_string(), netrc.machine.clone()),
        ("DRONE_NETRC_USERNAME".to_string(), netrc.login.clone()),
        ("DRONE_NETRC_PASSWORD".to_string(), netrc.password.clone()),
        (
            "DRONE_NETRC_FILE".to_string(),
            format!(
                "machine {} login {} password {}",
                netrc.machine, netrc.login, netrc.password
            ),
        ),
    ])
}

/// Proxy variables inherited from the runner process, exported in both
/// spellings.
pub fn proxy() -> HashMap<String, String> {
    let mut out = HashMap::new();
    for key in ["no_proxy", "http_proxy", "https_proxy", "all_proxy"] {
        let value = std::env::var(key)
            .or_else(|_| std::env::var(key.to_uppercase()))
            .unwrap_or_default();
        if !value.is_empty() {
            out.insert(key.to_string(), value.clone());
            out.insert(key.to_uppercase(), value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_precedence() {
        let a = HashMap::from([
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "1".to_string()),
        ]);
        let b = HashMap::from([("B".to_string(), "2".to_string())]);
        let out = combine(&[&a, &b]);
        assert_eq!(out["A"], "1");
        assert_eq!(out["B"], "2");
    }

    #[test]
    fn test_combine_drops_empty_values() {
        let a = HashMap::from([("A".to_string(), "1".to_string())]);
        let b = HashMap::from([("A".to_string(), String::new())]);
        let out = combine(&[&a, &b]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_tag_ref_variables() {
        let envs = build(&Build {
            event: "tag".to_string(),
            git_ref: "refs/tags/v1.2.3".to_string(),
            ..Default::default()
        });
        assert_eq!(envs["DRONE_TAG"], "v1.2.3");
    }

    #[test]
    fn test_netrc_requires_machine() {
        assert!(netrc(&Netrc::default()).is_empty());
        let envs = netrc(&Netrc {
            machine: "github.com".to_string(),
            login: "octocat".to_string(),
            password: "pass".to_string(),
        });
        assert_eq!(
            envs["DRONE_NETRC_FILE"],
            "machine github.com login octocat password pass"
        );
    }
}
