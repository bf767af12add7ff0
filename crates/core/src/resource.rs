//! Parsed pipeline resource.
//!
//! The pipeline document as authored by the user, after YAML decoding and
//! before compilation. The document is immutable once parsed; the compiler
//! lowers it into a [`crate::spec::Spec`] and discards it.

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// Pipeline is a user-authored graph of steps to run for a build.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub kind: String,
    #[serde(default, rename = "type")]
    pub pipeline_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: Platform,
    #[serde(default)]
    pub clone: CloneConfig,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub services: Vec<Step>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub volumes: Vec<VolumeDecl>,
    #[serde(default, alias = "pull_secrets")]
    pub image_pull_secrets: Vec<String>,
    #[serde(default)]
    pub workspace: Workspace,
    /// When set, unresolved secret references fail the stage instead of
    /// rendering empty.
    #[serde(default)]
    pub secrets_required: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloneConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub depth: i64,
    #[serde(default)]
    pub retries: i64,
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default)]
    pub trace: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub path: String,
}

/// A single containerized command in the pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub devices: Vec<DeviceDecl>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub dns_search: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, EnvValue>,
    #[serde(default)]
    pub extra_hosts: Vec<String>,
    #[serde(default)]
    pub failure: String,
    #[serde(default, alias = "network")]
    pub network_mode: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub pull: String,
    #[serde(default)]
    pub settings: HashMap<String, SettingsValue>,
    #[serde(default)]
    pub shm_size: i64,
    #[serde(default)]
    pub mem_limit: i64,
    #[serde(default)]
    pub memswap_limit: i64,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub volumes: Vec<MountDecl>,
    #[serde(default)]
    pub when: Conditions,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub strategy: Option<Strategy>,
}

/// Execution strategy. A matrix fans the step out into one copy per axis
/// with the axis values exposed to `${{ matrix.* }}` templates.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: Vec<HashMap<String, String>>,
}

/// Environment variable value: a literal or a secret reference.
#[derive(Debug, Clone)]
pub enum EnvValue {
    Literal(String),
    Secret { from_secret: String },
}

impl Default for EnvValue {
    fn default() -> Self {
        EnvValue::Literal(String::new())
    }
}

impl<'de> Deserialize<'de> for EnvValue {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct EnvVisitor;

        impl<'de> Visitor<'de> for EnvVisitor {
            type Value = EnvValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("string, scalar, or from_secret mapping")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<EnvValue, E> {
                Ok(EnvValue::Literal(v.to_string()))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<EnvValue, E> {
                Ok(EnvValue::Literal(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<EnvValue, E> {
                Ok(EnvValue::Literal(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<EnvValue, E> {
                Ok(EnvValue::Literal(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<EnvValue, E> {
                Ok(EnvValue::Literal(v.to_string()))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<EnvValue, A::Error> {
                let mut from_secret = None;
                while let Some(key) = map.next_key::<String>()? {
                    let value = map.next_value::<String>()?;
                    if key == "from_secret" {
                        from_secret = Some(value);
                    }
                }
                match from_secret {
                    Some(name) => Ok(EnvValue::Secret { from_secret: name }),
                    None => Err(de::Error::custom("expected from_secret key")),
                }
            }
        }

        d.deserialize_any(EnvVisitor)
    }
}

/// Plugin settings value: scalar, list, map, or a secret reference.
#[derive(Debug, Clone)]
pub enum SettingsValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<SettingsValue>),
    Map(HashMap<String, SettingsValue>),
    Secret { from_secret: String },
}

impl<'de> Deserialize<'de> for SettingsValue {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct SettingsVisitor;

        impl<'de> Visitor<'de> for SettingsVisitor {
            type Value = SettingsValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("scalar, sequence, or mapping")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<SettingsValue, E> {
                Ok(SettingsValue::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<SettingsValue, E> {
                Ok(SettingsValue::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<SettingsValue, E> {
                Ok(SettingsValue::Int(v as i64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<SettingsValue, E> {
                Ok(SettingsValue::Float(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<SettingsValue, E> {
                Ok(SettingsValue::Text(v.to_string()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<SettingsValue, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(SettingsValue::List(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<SettingsValue, A::Error> {
                let mut entries = HashMap::new();
                while let Some((key, value)) = map.next_entry::<String, SettingsValue>()? {
                    entries.insert(key, value);
                }
                if entries.len() == 1 {
                    if let Some(SettingsValue::Text(name)) = entries.get("from_secret") {
                        return Ok(SettingsValue::Secret {
                            from_secret: name.clone(),
                        });
                    }
                }
                Ok(SettingsValue::Map(entries))
            }
        }

        d.deserialize_any(SettingsVisitor)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MountDecl {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "mount_path")]
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceDecl {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
}

/// Volume declaration: exactly one backing kind should be set; the linter
/// rejects anything else.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeDecl {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "temp")]
    pub empty_dir: Option<EmptyDirDecl>,
    #[serde(default, alias = "host")]
    pub host_path: Option<HostPathDecl>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmptyDirDecl {
    #[serde(default)]
    pub medium: String,
    #[serde(default)]
    pub size_limit: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostPathDecl {
    #[serde(default)]
    pub path: String,
}

/// When-conditions for a step. Each field constrains one dimension of the
/// build; a step runs when every declared constraint matches.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Conditions {
    #[serde(default)]
    pub action: Constraint,
    #[serde(default)]
    pub branch: Constraint,
    #[serde(default)]
    pub cron: Constraint,
    #[serde(default)]
    pub event: Constraint,
    #[serde(default)]
    pub instance: Constraint,
    #[serde(default, rename = "ref")]
    pub git_ref: Constraint,
    #[serde(default)]
    pub repo: Constraint,
    #[serde(default)]
    pub status: Constraint,
    #[serde(default)]
    pub target: Constraint,
}

/// The build dimensions a step condition is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct Match {
    pub action: String,
    pub branch: String,
    pub cron: String,
    pub event: String,
    pub instance: String,
    pub git_ref: String,
    pub repo: String,
    pub target: String,
}

impl Conditions {
    /// Reports whether the step matches the build dimensions. The status
    /// constraint is intentionally excluded here; it drives the run
    /// policy instead.
    pub fn matches(&self, m: &Match) -> bool {
        self.action.matches(&m.action)
            && self.branch.matches(&m.branch)
            && self.cron.matches(&m.cron)
            && self.event.matches(&m.event)
            && self.instance.matches(&m.instance)
            && self.git_ref.matches(&m.git_ref)
            && self.repo.matches(&m.repo)
            && self.target.matches(&m.target)
    }
}

/// Include/exclude pattern constraint.
#[derive(Debug, Clone, Default)]
pub struct Constraint {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Constraint {
    pub fn matches(&self, v: &str) -> bool {
        if self.exclude.iter().any(|p| match_pattern(p, v)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|p| match_pattern(p, v))
    }
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct ConstraintVisitor;

        impl<'de> Visitor<'de> for ConstraintVisitor {
            type Value = Constraint;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("string, sequence, or include/exclude mapping")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Constraint, E> {
                Ok(Constraint {
                    include: vec![v.to_string()],
                    exclude: Vec::new(),
                })
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Constraint, A::Error> {
                let mut include = Vec::new();
                while let Some(item) = seq.next_element::<String>()? {
                    include.push(item);
                }
                Ok(Constraint {
                    include,
                    exclude: Vec::new(),
                })
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Constraint, A::Error> {
                let mut out = Constraint::default();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "include" => out.include = map.next_value()?,
                        "exclude" => out.exclude = map.next_value()?,
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                Ok(out)
            }
        }

        d.deserialize_any(ConstraintVisitor)
    }
}

/// Wildcard pattern match. `*` matches within a path segment, `**`
/// matches across segments.
pub fn match_pattern(pattern: &str, value: &str) -> bool {
    fn matches(p: &[char], v: &[char]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some('*'), _) => {
                if p.get(1) == Some(&'*') {
                    // ** crosses segment boundaries
                    matches(&p[2..], v) || (!v.is_empty() && matches(p, &v[1..]))
                } else {
                    matches(&p[1..], v) || (v.first().is_some_and(|&c| c != '/') && matches(p, &v[1..]))
                }
            }
            (Some(&pc), Some(&vc)) if pc == vc => matches(&p[1..], &v[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value.chars().collect();
    matches(&p, &v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_pattern() {
        assert!(match_pattern("main", "main"));
        assert!(match_pattern("refs/heads/*", "refs/heads/main"));
        assert!(!match_pattern("refs/heads/*", "refs/heads/feature/x"));
        assert!(match_pattern("refs/**", "refs/heads/feature/x"));
        assert!(match_pattern("*", "anything"));
        assert!(!match_pattern("release-*", "hotfix-1"));
    }

    #[test]
    fn test_constraint_excludes_win() {
        let c = Constraint {
            include: vec!["*".to_string()],
            exclude: vec!["main".to_string()],
        };
        assert!(!c.matches("main"));
        assert!(c.matches("develop"));
    }

    #[test]
    fn test_parse_step_environment() {
        let text = r#"
name: build
image: golang
environment:
  LITERAL: plain
  PORT: 8080
  TOKEN:
    from_secret: api_token
"#;
        let step: Step = serde_yaml::from_str(text).unwrap();
        assert!(matches!(
            step.environment.get("LITERAL"),
            Some(EnvValue::Literal(v)) if v == "plain"
        ));
        assert!(matches!(
            step.environment.get("PORT"),
            Some(EnvValue::Literal(v)) if v == "8080"
        ));
        assert!(matches!(
            step.environment.get("TOKEN"),
            Some(EnvValue::Secret { from_secret }) if from_secret == "api_token"
        ));
    }

    #[test]
    fn test_parse_when_conditions() {
        let text = r#"
name: notify
image: plugins/slack
when:
  branch: [main]
  event:
    include: [push, tag]
    exclude: [pull_request]
  status: [failure]
"#;
        let step: Step = serde_yaml::from_str(text).unwrap();
        assert_eq!(step.when.branch.include, vec!["main"]);
        assert_eq!(step.when.event.exclude, vec!["pull_request"]);
        assert_eq!(step.when.status.include, vec!["failure"]);
    }

    #[test]
    fn test_parse_volume_decls() {
        let text = r#"
name: default
volumes:
  - name: cache
    temp: {}
  - name: docker
    host:
      path: /var/run/docker.sock
"#;
        let pipeline: Pipeline = serde_yaml::from_str(text).unwrap();
        assert!(pipeline.volumes[0].empty_dir.is_some());
        assert_eq!(
            pipeline.volumes[1].host_path.as_ref().unwrap().path,
            "/var/run/docker.sock"
        );
    }
}
