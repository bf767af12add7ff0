//! Pipeline compiler.
//!
//! Lowers a validated pipeline document plus contextual inputs (build,
//! repo, stage, system, netrc, providers) into the executable Spec:
//! container steps, shared volumes, a dedicated network and secret
//! bindings.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use hodei_runner_core::resource::{Match, Pipeline, Step as ResourceStep};
use hodei_runner_core::spec::{
    Network, Secret, Spec, Step, Volume, VolumeEmptyDir, VolumeHostPath, VolumeMount,
};
use hodei_runner_core::{
    environ, image, Build, DomainError, Netrc, PullPolicy, Repo, RunPolicy, Stage, System,
};
use hodei_runner_ports::{
    CombineSecrets, EnvProvider, EnvRequest, RegistryProvider, RegistryRequest, SecretProvider,
    SecretRequest,
};

use crate::auths;
use crate::clone::{self, CLONE_STEP_NAME};
use crate::labels;
use crate::shell::setup_script;
use crate::step::create_step;
use crate::workspace::{create_workspace, setup_workdir};

/// Images that execute with privileged capabilities in order to run
/// docker-in-docker, unless the step overrides commands or mounts.
pub const PRIVILEGED_DEFAULTS: &[&str] = &[
    "plugins/docker",
    "plugins/acr",
    "plugins/ecr",
    "plugins/gcr",
    "plugins/heroku",
];

// environment variables that deny privilege escalation when referenced
// by a plugin step.
const RESTRICTED_VARS: &[&str] = &["XDG_RUNTIME_DIR", "DOCKER_OPTS", "DOCKER_HOST", "PATH", "HOME"];

/// ID generator; swappable so tests can pin IDs.
pub type IdGen = Arc<dyn Fn() -> String + Send + Sync>;

pub fn random_id() -> String {
    format!("hodei-{}", Uuid::new_v4().simple())
}

/// Container resource constraints applied per-container.
#[derive(Debug, Clone, Default)]
pub struct Resources {
    pub memory: i64,
    pub memory_swap: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub cpu_shares: i64,
    pub cpu_set: Vec<String>,
    pub shm_size: i64,
}

/// Remote-debug shell configuration.
#[derive(Debug, Clone, Default)]
pub struct Tmate {
    pub enabled: bool,
    pub image: String,
    pub server: String,
    pub port: String,
    pub rsa_fingerprint: String,
    pub ed25519_fingerprint: String,
    pub authorized_keys: String,
}

/// Compiler inputs for a single stage.
#[derive(Clone)]
pub struct Args {
    pub pipeline: Arc<Pipeline>,
    pub build: Build,
    pub repo: Repo,
    pub stage: Stage,
    pub system: System,
    pub netrc: Netrc,
    /// Stage-delivered secrets, combined with the compiler's global
    /// provider during resolution.
    pub secret: Option<Arc<dyn SecretProvider>>,
}

/// Compiles the pipeline configuration to an intermediate representation
/// optimized for execution.
pub struct Compiler {
    /// Provider of global environment variables added to every step.
    pub environ: Option<Arc<dyn EnvProvider>>,
    /// Labels added to every container.
    pub labels: HashMap<String, String>,
    /// Images that are always privileged.
    pub privileged: Vec<String>,
    /// Networks attached to every container.
    pub networks: Vec<String>,
    /// Host volumes mounted into every container, source path to target
    /// path, with an optional `:ro` suffix on the target.
    pub volumes: HashMap<String, String>,
    /// Overrides the default clone image.
    pub clone_image: String,
    /// Global resource constraints.
    pub resources: Resources,
    /// Global secret provider.
    pub secret: Option<Arc<dyn SecretProvider>>,
    /// Registry credential provider.
    pub registry: Option<Arc<dyn RegistryProvider>>,
    /// Overrides the workspace volume with a host path mount and
    /// disables cloning.
    pub mount: String,
    /// Remote-debug configuration.
    pub tmate: Tmate,
    /// Restricts netrc injection to the clone step.
    pub netrc_clone_only: bool,
    /// ID generator.
    pub id_gen: IdGen,
}

impl Default for Compiler {
    fn default() -> Self {
        Self {
            environ: None,
            labels: HashMap::new(),
            privileged: PRIVILEGED_DEFAULTS.iter().map(|s| s.to_string()).collect(),
            networks: Vec::new(),
            volumes: HashMap::new(),
            clone_image: String::new(),
            resources: Resources::default(),
            secret: None,
            registry: None,
            mount: String::new(),
            tmate: Tmate::default(),
            netrc_clone_only: false,
            id_gen: Arc::new(random_id),
        }
    }
}

impl Compiler {
    /// Compiles the configuration file.
    pub async fn compile(&self, args: &Args) -> Result<Spec, DomainError> {
        let pipeline: &Pipeline = args.pipeline.as_ref();
        let os = pipeline.platform.os.as_str();

        // create the workspace paths. if the source is mounted from the
        // host the target mount path collapses to the full path.
        let (mut base, mut path, full) = create_workspace(pipeline);
        if !self.mount.is_empty() {
            base = full.clone();
            path = String::new();
        }

        let stage_labels = labels::combine(&[
            &self.labels,
            &labels::from_repo(&args.repo),
            &labels::from_build(&args.build),
            &labels::from_stage(&args.stage),
            &labels::from_system(&args.system),
            &labels::with_timeout(&args.repo),
        ]);

        // the workspace mount, shared by every step.
        let mount = VolumeMount {
            name: "_workspace".to_string(),
            path: base.clone(),
        };

        let mut workspace_volume = Volume {
            empty_dir: Some(VolumeEmptyDir {
                id: (self.id_gen)(),
                name: mount.name.clone(),
                labels: stage_labels.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        // if the repository is mounted from a local volume, replace the
        // data volume with a host machine volume declaration.
        if !self.mount.is_empty() {
            workspace_volume = Volume {
                empty_dir: None,
                host_path: Some(VolumeHostPath {
                    id: (self.id_gen)(),
                    name: mount.name.clone(),
                    path: self.mount.clone(),
                    labels: stage_labels.clone(),
                    ..Default::default()
                }),
            };
        }

        let mut spec = Spec {
            network: Network {
                id: (self.id_gen)(),
                labels: stage_labels.clone(),
                ..Default::default()
            },
            platform: hodei_runner_core::spec::Platform {
                os: pipeline.platform.os.clone(),
                arch: pipeline.platform.arch.clone(),
                variant: pipeline.platform.variant.clone(),
                version: pipeline.platform.version.clone(),
            },
            volumes: vec![workspace_volume.clone()],
            secrets_required: pipeline.secrets_required,
            ..Default::default()
        };

        // list the global environment variables.
        let globals = match &self.environ {
            Some(provider) => provider
                .list(&EnvRequest {
                    build: args.build.clone(),
                    repo: args.repo.clone(),
                })
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "cannot list global environment variables");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let unmasked_globals: HashMap<String, String> = globals
            .iter()
            .filter(|v| !v.mask)
            .map(|v| (v.name.clone(), v.data.clone()))
            .collect();

        // layer the base environment. later maps win.
        let mut envs = environ::combine(&[
            &unmasked_globals,
            &args.build.params,
            &pipeline.environment,
            &environ::proxy(),
            &environ::system(&args.system),
            &environ::repo(&args.repo),
            &environ::build(&args.build),
            &environ::stage(&args.stage),
            &environ::link(&args.repo, &args.build, &args.system),
            &clone_author_envs(&args.build, pipeline),
        ]);

        envs.insert("DRONE_DOCKER_NETWORK_ID".to_string(), spec.network.id.clone());
        envs.insert("DRONE_WORKSPACE".to_string(), full.clone());
        envs.insert("DRONE_WORKSPACE_BASE".to_string(), base.clone());
        envs.insert("DRONE_WORKSPACE_PATH".to_string(), path.clone());
        envs.insert("CI_WORKSPACE".to_string(), full.clone());
        match (&workspace_volume.empty_dir, &workspace_volume.host_path) {
            (Some(empty_dir), _) => {
                envs.insert("DRONE_DOCKER_VOLUME_ID".to_string(), empty_dir.id.clone());
            }
            (_, Some(host_path)) => {
                envs.insert(
                    "DRONE_DOCKER_VOLUME_PATH".to_string(),
                    host_path.path.clone(),
                );
            }
            _ => {}
        }

        let netrc_envs = environ::netrc(&args.netrc);
        if !self.netrc_clone_only {
            envs = environ::combine(&[&envs, &netrc_envs]);
        }

        let tmate_active =
            self.tmate.enabled && args.build.debug && pipeline.platform.os != "windows";
        if tmate_active {
            for (key, value) in self.tmate_envs() {
                envs.insert(key, value);
            }
        }

        let match_ctx = Match {
            action: args.build.action.clone(),
            branch: args.build.target.clone(),
            cron: args.build.cron.clone(),
            event: args.build.event.clone(),
            instance: args.system.host.clone(),
            git_ref: args.build.git_ref.clone(),
            repo: args.repo.slug.clone(),
            target: args.build.deploy_to.clone(),
        };

        // create the clone step.
        if !pipeline.clone.disable {
            let mut step = clone::create_clone(pipeline);
            step.id = (self.id_gen)();
            step.envs = environ::combine(&[&envs, &netrc_envs, &step.envs]);
            step.working_dir = full.clone();
            step.labels = stage_labels.clone();
            step.volumes.push(mount.clone());
            if !self.clone_image.is_empty() {
                step.image = self.clone_image.clone();
            }
            if !self.mount.is_empty() {
                step.run_policy = RunPolicy::Never;
            }
            spec.steps.push(step);
        }

        // create the service steps.
        for src in &pipeline.services {
            let mut dst = create_step(src, (self.id_gen)());
            dst.detach = true;
            dst.envs = environ::combine(&[&envs, &dst.envs]);
            dst.volumes.push(mount.clone());
            dst.labels = stage_labels.clone();
            setup_script(&src.commands, &mut dst, os);
            setup_workdir(src.commands.is_empty(), &mut dst, &full);
            if !src.when.matches(&match_ctx) {
                dst.run_policy = RunPolicy::Never;
            }
            if self.is_privileged(src) {
                dst.privileged = true;
            }
            spec.steps.push(dst);
        }

        // create the pipeline steps.
        for src in &pipeline.steps {
            let mut dst = create_step(src, (self.id_gen)());
            dst.envs = environ::combine(&[&envs, &dst.envs]);
            dst.volumes.push(mount.clone());
            dst.labels = stage_labels.clone();
            setup_script(&src.commands, &mut dst, os);
            setup_workdir(src.commands.is_empty(), &mut dst, &full);
            if !src.when.matches(&match_ctx) {
                dst.run_policy = RunPolicy::Never;
            }
            // steps with an approved image automatically run with
            // escalated privileges.
            if self.is_privileged(src) {
                dst.privileged = true;
            }
            spec.steps.push(dst);
        }

        // inject the tmate internal step and addons volume.
        if tmate_active {
            self.setup_tmate(&mut spec, &stage_labels);
        }

        if !is_graph(&spec) {
            configure_serial(&mut spec);
        } else if !pipeline.clone.disable {
            configure_clone_deps(&mut spec);
        } else {
            remove_clone_deps(&mut spec);
        }

        // resolve secrets. stage-delivered secrets take precedence over
        // the global provider.
        let providers: Vec<Arc<dyn SecretProvider>> = match (
            args.secret.clone(),
            self.secret.clone(),
        ) {
            (Some(stage), Some(global)) => {
                vec![Arc::new(CombineSecrets::new(vec![stage, global]))]
            }
            (Some(stage), None) => vec![stage],
            (None, Some(global)) => vec![global],
            (None, None) => Vec::new(),
        };
        let mut missing = Vec::new();
        for step in spec.steps.iter_mut() {
            for secret in step.secrets.iter_mut() {
                match find_secret(&providers, args, &secret.name).await {
                    Some(value) => secret.data = value.into_bytes(),
                    None => missing.push(secret.name.clone()),
                }
            }
        }
        if pipeline.secrets_required && !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(DomainError::Validation(format!(
                "missing required secrets: {}",
                missing.join(", ")
            )));
        }

        // gather registry credentials from the provider and the named
        // pull secrets.
        let mut creds = match &self.registry {
            Some(provider) => provider
                .list(&RegistryRequest {
                    build: args.build.clone(),
                    repo: args.repo.clone(),
                })
                .await
                .map_err(DomainError::Infrastructure)?,
            None => Vec::new(),
        };
        for name in &pipeline.image_pull_secrets {
            if let Some(value) = find_secret(&providers, args, name).await {
                match auths::parse_docker_config(&value) {
                    Ok(mut parsed) => {
                        parsed.extend(creds);
                        creds = parsed;
                    }
                    Err(err) => {
                        warn!(secret = %name, error = %err, "cannot parse registry credentials");
                    }
                }
            }
        }

        for step in spec.steps.iter_mut() {
            if let Some(cred) = creds
                .iter()
                .find(|c| image::match_hostname(&step.image, &c.address))
            {
                step.auth = Some(hodei_runner_core::Auth {
                    address: cred.address.clone(),
                    username: cred.username.clone(),
                    password: cred.password.clone(),
                });
            }
        }

        // masked globals are appended to every step as synthetic secrets
        // so their values are redacted in the logs.
        let masked: Vec<Secret> = globals
            .iter()
            .filter(|v| v.mask)
            .map(|v| Secret {
                name: v.name.clone(),
                env: v.name.clone(),
                data: v.data.clone().into_bytes(),
                mask: true,
            })
            .collect();
        for step in spec.steps.iter_mut() {
            for global in &masked {
                step.envs.insert(global.name.clone(), global.value());
                step.secrets.push(global.clone());
            }
        }

        // apply global resource limits. yaml-level values take
        // precedence over globals where set.
        for step in spec.steps.iter_mut() {
            if step.memswap_limit == 0 {
                step.memswap_limit = self.resources.memory_swap;
            }
            if step.mem_limit == 0 {
                step.mem_limit = self.resources.memory;
            }
            if step.shm_size == 0 {
                step.shm_size = self.resources.shm_size;
            }
            step.cpu_period = self.resources.cpu_period;
            step.cpu_quota = self.resources.cpu_quota;
            step.cpu_shares = self.resources.cpu_shares;
            step.cpu_set = self.resources.cpu_set.clone();
            step.networks.extend(self.networks.iter().cloned());
        }

        // append global host volumes.
        let mut volume_keys: Vec<&String> = self.volumes.keys().collect();
        volume_keys.sort();
        for source in volume_keys {
            let target = &self.volumes[source];
            let id = (self.id_gen)();
            let read_only = target.ends_with(":ro");
            let target = target.trim_end_matches(":ro").to_string();
            spec.volumes.push(Volume {
                host_path: Some(VolumeHostPath {
                    id: id.clone(),
                    name: id.clone(),
                    path: source.clone(),
                    read_only,
                    ..Default::default()
                }),
                ..Default::default()
            });
            for step in spec.steps.iter_mut() {
                step.volumes.push(VolumeMount {
                    name: id.clone(),
                    path: target.clone(),
                });
            }
        }

        // append user-declared volumes.
        for decl in &pipeline.volumes {
            let id = (self.id_gen)();
            if let Some(empty_dir) = &decl.empty_dir {
                spec.volumes.push(Volume {
                    empty_dir: Some(VolumeEmptyDir {
                        id,
                        name: decl.name.clone(),
                        medium: empty_dir.medium.clone(),
                        size_limit: empty_dir.size_limit,
                        labels: stage_labels.clone(),
                    }),
                    ..Default::default()
                });
            } else if let Some(host_path) = &decl.host_path {
                spec.volumes.push(Volume {
                    host_path: Some(VolumeHostPath {
                        id,
                        name: decl.name.clone(),
                        path: host_path.path.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
            }
        }

        Ok(spec)
    }

    // privileged-by-default is enabled only for plugin-style steps that
    // define no commands, command or entrypoint, match the whitelist, and
    // neither mount volumes/devices nor reference restricted variables.
    fn is_privileged(&self, step: &ResourceStep) -> bool {
        if !step.commands.is_empty() || !step.command.is_empty() || !step.entrypoint.is_empty() {
            return false;
        }
        if !step.volumes.is_empty() || !step.devices.is_empty() {
            return false;
        }
        if step
            .environment
            .keys()
            .any(|k| RESTRICTED_VARS.contains(&k.as_str()))
        {
            return false;
        }
        self.privileged
            .iter()
            .any(|img| image::match_repository(img, &step.image))
    }

    fn tmate_envs(&self) -> HashMap<String, String> {
        let mut envs = HashMap::from([(
            "DRONE_TMATE_ENABLED".to_string(),
            "true".to_string(),
        )]);
        if !self.tmate.server.is_empty() {
            envs.insert("DRONE_TMATE_HOST".to_string(), self.tmate.server.clone());
            envs.insert("DRONE_TMATE_PORT".to_string(), self.tmate.port.clone());
            envs.insert(
                "DRONE_TMATE_FINGERPRINT_RSA".to_string(),
                self.tmate.rsa_fingerprint.clone(),
            );
            envs.insert(
                "DRONE_TMATE_FINGERPRINT_ED25519".to_string(),
                self.tmate.ed25519_fingerprint.clone(),
            );
        }
        if !self.tmate.authorized_keys.is_empty() {
            envs.insert(
                "DRONE_TMATE_AUTHORIZED_KEYS".to_string(),
                self.tmate.authorized_keys.clone(),
            );
        }
        envs
    }

    // injects the internal step that copies the tmate binary into a
    // shared addons volume mounted into every step.
    fn setup_tmate(&self, spec: &mut Spec, stage_labels: &HashMap<String, String>) {
        let volume_id = (self.id_gen)();
        spec.volumes.push(Volume {
            empty_dir: Some(VolumeEmptyDir {
                id: volume_id,
                name: "_addons".to_string(),
                labels: stage_labels.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });

        let addons_mount = VolumeMount {
            name: "_addons".to_string(),
            path: "/usr/drone/bin".to_string(),
        };

        spec.internal.push(Step {
            id: (self.id_gen)(),
            name: "tmate".to_string(),
            image: self.tmate.image.clone(),
            pull: PullPolicy::IfNotExists,
            entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
            command: vec!["cp /bin/drone-tmate /usr/drone/bin/tmate".to_string()],
            labels: stage_labels.clone(),
            volumes: vec![addons_mount.clone()],
            ..Default::default()
        });

        for step in spec.steps.iter_mut() {
            step.volumes.push(addons_mount.clone());
        }
    }
}

// GIT_* identity variables for the clone plugin.
fn clone_author_envs(build: &Build, pipeline: &Pipeline) -> HashMap<String, String> {
    let mut envs = HashMap::from([
        ("GIT_AUTHOR_NAME".to_string(), build.author_name.clone()),
        ("GIT_AUTHOR_EMAIL".to_string(), build.author_email.clone()),
        ("GIT_COMMITTER_NAME".to_string(), build.author_name.clone()),
        (
            "GIT_COMMITTER_EMAIL".to_string(),
            build.author_email.clone(),
        ),
        ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
    ]);
    if pipeline.clone.skip_verify {
        envs.insert("GIT_SSL_NO_VERIFY".to_string(), "true".to_string());
    }
    if pipeline.clone.trace {
        envs.insert("GIT_TRACE".to_string(), "true".to_string());
    }
    envs
}

async fn find_secret(
    providers: &[Arc<dyn SecretProvider>],
    args: &Args,
    name: &str,
) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    let req = SecretRequest {
        name: name.to_string(),
        build: args.build.clone(),
        repo: args.repo.clone(),
    };
    for provider in providers {
        match provider.find(&req).await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => continue,
            Err(err) => {
                warn!(secret = %name, error = %err, "secret provider error");
            }
        }
    }
    None
}

// true when the pipeline manually defines an execution graph.
fn is_graph(spec: &Spec) -> bool {
    spec.steps.iter().any(|s| !s.depends_on.is_empty())
}

// links the steps serially in source order.
fn configure_serial(spec: &mut Spec) {
    let mut prev: Option<String> = None;
    for step in spec.steps.iter_mut() {
        if let Some(prev_name) = prev.take() {
            step.depends_on = vec![prev_name];
        }
        prev = Some(step.name.clone());
    }
}

// adds the clone step as a predecessor to every root step.
fn configure_clone_deps(spec: &mut Spec) {
    for step in spec.steps.iter_mut() {
        if step.name == CLONE_STEP_NAME {
            continue;
        }
        if step.depends_on.is_empty() {
            step.depends_on = vec![CLONE_STEP_NAME.to_string()];
        }
    }
}

// strips explicit clone dependencies when cloning is disabled.
fn remove_clone_deps(spec: &mut Spec) {
    if spec.steps.iter().any(|s| s.name == CLONE_STEP_NAME) {
        return;
    }
    for step in spec.steps.iter_mut() {
        if step.depends_on.len() == 1 && step.depends_on[0] == CLONE_STEP_NAME {
            step.depends_on.clear();
        }
    }
}
