//! Clone step synthesis.
//!
//! The clone step is automatically added to each pipeline unless cloning
//! is disabled. It materializes the repository into the workspace volume
//! using the platform-specific git plugin image.

use std::collections::HashMap;

use hodei_runner_core::resource::{CloneConfig, Pipeline};
use hodei_runner_core::spec::Step;
use hodei_runner_core::{PullPolicy, RunPolicy};

/// Reserved name of the synthesized clone step.
pub const CLONE_STEP_NAME: &str = "clone";

/// Returns the clone image for the target operating system.
pub fn clone_image(os: &str) -> &'static str {
    match os {
        "windows" => "drone/git:latest",
        _ => "drone/git:latest",
    }
}

/// Clone plugin parameters derived from the pipeline's clone config.
pub fn clone_params(src: &CloneConfig) -> HashMap<String, String> {
    let mut dst = HashMap::new();
    if src.depth > 0 {
        dst.insert("PLUGIN_DEPTH".to_string(), src.depth.to_string());
    }
    if src.retries > 0 {
        dst.insert("PLUGIN_RETRIES".to_string(), src.retries.to_string());
    }
    if src.skip_verify {
        dst.insert("GIT_SSL_NO_VERIFY".to_string(), "true".to_string());
        dst.insert("PLUGIN_SKIP_VERIFY".to_string(), "true".to_string());
    }
    if src.trace {
        dst.insert("PLUGIN_TRACE".to_string(), "true".to_string());
    }
    dst
}

/// Creates the default clone step configuration. Always pulled
/// if-not-exists so an air-gapped cache is honored.
pub fn create_clone(src: &Pipeline) -> Step {
    Step {
        name: CLONE_STEP_NAME.to_string(),
        image: clone_image(&src.platform.os).to_string(),
        run_policy: RunPolicy::Always,
        pull: PullPolicy::IfNotExists,
        envs: clone_params(&src.clone),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_params() {
        let params = clone_params(&CloneConfig {
            depth: 50,
            skip_verify: true,
            ..Default::default()
        });
        assert_eq!(params["PLUGIN_DEPTH"], "50");
        assert_eq!(params["GIT_SSL_NO_VERIFY"], "true");
        assert_eq!(params["PLUGIN_SKIP_VERIFY"], "true");
        assert!(!params.contains_key("PLUGIN_RETRIES"));
    }

    #[test]
    fn test_create_clone() {
        let step = create_clone(&Pipeline::default());
        assert_eq!(step.name, "clone");
        assert_eq!(step.run_policy, RunPolicy::Always);
        assert_eq!(step.pull, PullPolicy::IfNotExists);
    }
}
