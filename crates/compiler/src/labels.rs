//! Stage-wide container labels.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use hodei_runner_core::{Build, Repo, Stage, System};

/// Combines label maps left to right; later entries win.
pub fn combine(maps: &[&HashMap<String, String>]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for map in maps {
        for (k, v) in map.iter() {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

pub fn from_repo(repo: &Repo) -> HashMap<String, String> {
    HashMap::from([
        ("io.drone.repo.namespace".to_string(), repo.namespace.clone()),
        ("io.drone.repo.name".to_string(), repo.name.clone()),
        ("io.drone.repo.slug".to_string(), repo.slug.clone()),
    ])
}

pub fn from_build(build: &Build) -> HashMap<String, String> {
    HashMap::from([
        ("io.drone.build.number".to_string(), build.number.to_string()),
        ("io.drone.build.event".to_string(), build.event.clone()),
    ])
}

pub fn from_stage(stage: &Stage) -> HashMap<String, String> {
    HashMap::from([
        ("io.drone.stage.name".to_string(), stage.name.clone()),
        ("io.drone.stage.number".to_string(), stage.number.to_string()),
    ])
}

pub fn from_system(system: &System) -> HashMap<String, String> {
    HashMap::from([
        ("io.drone.system.host".to_string(), system.host.clone()),
        ("io.drone.system.proto".to_string(), system.proto.clone()),
        ("io.drone.system.version".to_string(), system.version.clone()),
    ])
}

/// Creation and expiration timestamps derived from the repository
/// timeout, used by external reapers to garbage-collect leaked resources.
pub fn with_timeout(repo: &Repo) -> HashMap<String, String> {
    let now = Utc::now();
    let expires = now + Duration::minutes(repo.timeout.max(60));
    HashMap::from([
        ("io.drone.created".to_string(), now.timestamp().to_string()),
        (
            "io.drone.expires".to_string(),
            expires.timestamp().to_string(),
        ),
        ("io.drone.ttl".to_string(), format!("{}m0s", repo.timeout)),
    ])
}
