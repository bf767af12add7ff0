//! Workspace path computation.

use hodei_runner_core::resource::Pipeline;
use hodei_runner_core::spec::Step;

const WORKSPACE_PATH: &str = "/drone/src";

/// Computes the workspace `(base, path, full)` triple from the pipeline's
/// workspace configuration and target platform.
pub fn create_workspace(pipeline: &Pipeline) -> (String, String, String) {
    let mut base = pipeline.workspace.base.clone();
    let mut path = pipeline.workspace.path.clone();
    if base.is_empty() {
        if path.starts_with('/') {
            base = path;
            path = String::new();
        } else {
            base = WORKSPACE_PATH.to_string();
        }
    }
    let full = join(&base, &path);

    if pipeline.platform.os == "windows" {
        return (
            to_windows_drive(&base),
            to_windows_path(&path),
            to_windows_drive(&full),
        );
    }
    (base, path, full)
}

/// Sets the step working directory unless one is already configured or
/// the step is a command-less service.
pub fn setup_workdir(commands_empty: bool, dst: &mut Step, path: &str) {
    if !dst.working_dir.is_empty() {
        return;
    }
    if dst.detach && commands_empty {
        return;
    }
    dst.working_dir = path.to_string();
}

fn join(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn to_windows_drive(s: &str) -> String {
    format!("c:{}", to_windows_path(s))
}

fn to_windows_path(s: &str) -> String {
    s.replace('/', "\\")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hodei_runner_core::resource::{Platform, Workspace};

    fn pipeline(base: &str, path: &str, os: &str) -> Pipeline {
        Pipeline {
            workspace: Workspace {
                base: base.to_string(),
                path: path.to_string(),
            },
            platform: Platform {
                os: os.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let (base, path, full) = create_workspace(&pipeline("", "", "linux"));
        assert_eq!(base, "/drone/src");
        assert_eq!(path, "");
        assert_eq!(full, "/drone/src");
    }

    #[test]
    fn test_relative_path() {
        let (base, path, full) = create_workspace(&pipeline("", "octocat/hello", "linux"));
        assert_eq!(base, "/drone/src");
        assert_eq!(path, "octocat/hello");
        assert_eq!(full, "/drone/src/octocat/hello");
    }

    #[test]
    fn test_absolute_path_becomes_base() {
        let (base, path, full) = create_workspace(&pipeline("", "/workspace/src", "linux"));
        assert_eq!(base, "/workspace/src");
        assert_eq!(path, "");
        assert_eq!(full, "/workspace/src");
    }

    #[test]
    fn test_windows_paths() {
        let (base, path, full) = create_workspace(&pipeline("", "octocat/hello", "windows"));
        assert_eq!(base, "c:\\drone\\src");
        assert_eq!(path, "octocat\\hello");
        assert_eq!(full, "c:\\drone\\src\\octocat\\hello");
    }

    #[test]
    fn test_workdir_not_overridden() {
        let mut step = Step {
            working_dir: "/custom".to_string(),
            ..Default::default()
        };
        setup_workdir(true, &mut step, "/drone/src");
        assert_eq!(step.working_dir, "/custom");
    }

    #[test]
    fn test_workdir_skipped_for_commandless_service() {
        let mut step = Step {
            detach: true,
            ..Default::default()
        };
        setup_workdir(true, &mut step, "/drone/src");
        assert_eq!(step.working_dir, "");

        setup_workdir(false, &mut step, "/drone/src");
        assert_eq!(step.working_dir, "/drone/src");
    }
}
