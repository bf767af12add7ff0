//! Shell script generation.
//!
//! Steps that declare `commands` are wrapped in a generated shell script:
//! posix sh on linux, powershell on windows. The script is injected
//! through an environment variable and invoked via the entrypoint so the
//! container image's own shell never has to be guessed.

use hodei_runner_core::spec::Step;

/// Wraps the step commands in a shell script appropriate to the target
/// operating system.
pub fn setup_script(commands: &[String], dst: &mut Step, os: &str) {
    if commands.is_empty() {
        return;
    }
    match os {
        "windows" => {
            dst.envs.insert(
                "DRONE_SCRIPT".to_string(),
                powershell_script(commands),
            );
            dst.entrypoint = vec!["powershell".to_string(), "-noprofile".to_string()];
            dst.command = vec![
                "-command".to_string(),
                "Invoke-Expression $Env:DRONE_SCRIPT".to_string(),
            ];
        }
        _ => {
            dst.envs
                .insert("DRONE_SCRIPT".to_string(), posix_script(commands));
            dst.entrypoint = vec!["/bin/sh".to_string(), "-c".to_string()];
            dst.command = vec!["echo \"$DRONE_SCRIPT\" | /bin/sh".to_string()];
        }
    }
}

/// Generates a posix shell script: strict mode, then each command echoed
/// before it runs so the log mirrors the execution.
pub fn posix_script(commands: &[String]) -> String {
    let mut script = String::from("set -e\n");
    for command in commands {
        let escaped = echo_escape(command);
        script.push_str(&format!("echo + {escaped}\n{command}\n"));
    }
    script
}

/// Generates a powershell script with the equivalent failure semantics.
pub fn powershell_script(commands: &[String]) -> String {
    let mut script = String::from("$ErrorActionPreference = 'Stop';\n");
    for command in commands {
        let echoed = command.replace('\'', "''");
        script.push_str(&format!(
            "Write-Output '+ {echoed}';\n{command};\nif ($LastExitCode -gt 0) {{ exit $LastExitCode }}\n"
        ));
    }
    script
}

// single-quotes the command for echo, escaping embedded quotes.
fn echo_escape(command: &str) -> String {
    format!("'{}'", command.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_script_echoes_commands() {
        let script = posix_script(&["go build".to_string(), "go test ./...".to_string()]);
        assert!(script.starts_with("set -e\n"));
        assert!(script.contains("echo + 'go build'\ngo build\n"));
        assert!(script.contains("echo + 'go test ./...'\ngo test ./...\n"));
    }

    #[test]
    fn test_setup_script_posix() {
        let mut step = Step::default();
        setup_script(&["make".to_string()], &mut step, "linux");
        assert_eq!(step.entrypoint, vec!["/bin/sh", "-c"]);
        assert!(step.envs.contains_key("DRONE_SCRIPT"));
    }

    #[test]
    fn test_setup_script_windows() {
        let mut step = Step::default();
        setup_script(&["make".to_string()], &mut step, "windows");
        assert_eq!(step.entrypoint[0], "powershell");
        assert!(step.envs["DRONE_SCRIPT"].contains("$ErrorActionPreference"));
    }

    #[test]
    fn test_no_commands_no_wrapping() {
        let mut step = Step::default();
        setup_script(&[], &mut step, "linux");
        assert!(step.entrypoint.is_empty());
        assert!(step.envs.is_empty());
    }

    #[test]
    fn test_powershell_quotes_escaped() {
        let script = powershell_script(&["echo 'hi'".to_string()]);
        assert!(script.contains("Write-Output '+ echo ''hi''';"));
    }
}
