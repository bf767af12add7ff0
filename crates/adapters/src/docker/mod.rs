//! Docker pipeline engine.
//!
//! Implements the engine port against the Docker API via bollard-next:
//! Setup creates the stage volumes and network and runs internal steps,
//! Run drives a single container from pull to exit while streaming logs,
//! Destroy tears everything down best-effort.

pub mod errors;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard_next::auth::DockerCredentials;
use bollard_next::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard_next::image::CreateImageOptions;
use bollard_next::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard_next::service::{DeviceMapping, EndpointSettings, HostConfig};
use bollard_next::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard_next::Docker;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use hodei_runner_core::spec::{Spec, Step, Volume};
use hodei_runner_core::{image, CancelToken};
use hodei_runner_ports::{Engine, EngineError, LogWriter, RunState};

use self::errors::trim_extra_info;

// internal setup steps perform short-lived tasks and should never block
// pipeline execution for more than a minute.
const INTERNAL_STEP_TIMEOUT: Duration = Duration::from_secs(60);

/// Engine options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Opts {
    /// Suppresses image pull progress in the step log.
    pub hide_pull: bool,
}

/// Docker implementation of the pipeline engine.
pub struct DockerEngine {
    docker: Docker,
    hide_pull: bool,
}

impl DockerEngine {
    pub fn new(docker: Docker, opts: Opts) -> Self {
        Self {
            docker,
            hide_pull: opts.hide_pull,
        }
    }

    /// Connects to the Docker daemon using the platform defaults.
    pub fn new_env(opts: Opts) -> Result<Self, EngineError> {
        #[cfg(unix)]
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        #[cfg(windows)]
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        Ok(Self::new(docker, opts))
    }

    // emulates `docker pull`, streaming progress to the output unless
    // pulls are hidden.
    async fn pull(
        &self,
        step: &Step,
        output: &Arc<dyn LogWriter>,
    ) -> Result<(), EngineError> {
        let credentials = step.auth.as_ref().map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: Some(auth.address.clone()),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: step.image.as_str(),
                ..Default::default()
            }),
            None,
            credentials,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if self.hide_pull {
                        continue;
                    }
                    if let Some(status) = info.status {
                        let line = match info.id {
                            Some(id) => format!("{id}: {status}\n"),
                            None => format!("{status}\n"),
                        };
                        output.write(line.as_bytes());
                    }
                }
                Err(err) => {
                    return Err(EngineError::ImagePull {
                        image: step.image.clone(),
                        reason: trim_extra_info(&err.to_string()),
                    });
                }
            }
        }
        Ok(())
    }

    // emulates `docker create` with the pull-policy fallbacks.
    async fn create(
        &self,
        spec: &Spec,
        step: &Step,
        output: &Arc<dyn LogWriter>,
    ) -> Result<(), EngineError> {
        use hodei_runner_core::PullPolicy;

        // pull the latest image when requested by policy, or when the
        // image is tagged :latest.
        if step.pull == PullPolicy::Always
            || (step.pull == PullPolicy::Default && image::is_latest(&step.image))
        {
            self.pull(step, output).await?;
        }

        let options = CreateContainerOptions {
            name: step.id.clone(),
            ..Default::default()
        };
        let config = to_config(spec, step);

        let created = self
            .docker
            .create_container(Some(options.clone()), config.clone())
            .await;

        if let Err(err) = created {
            // pull and retry when the failure is a missing image.
            if !is_not_found(&err) || step.pull == PullPolicy::Never {
                return Err(EngineError::Run(trim_extra_info(&err.to_string())));
            }
            self.pull(step, output).await?;
            self.docker
                .create_container(Some(options), config)
                .await
                .map_err(|e| EngineError::Run(trim_extra_info(&e.to_string())))?;
        }

        // attach the container to user-defined global networks.
        if step.network.is_empty() {
            for net in &step.networks {
                let result = self
                    .docker
                    .connect_network(
                        net,
                        ConnectNetworkOptions {
                            container: step.id.clone(),
                            endpoint_config: EndpointSettings {
                                aliases: Some(vec![net.clone()]),
                                ..Default::default()
                            },
                        },
                    )
                    .await;
                if let Err(err) = result {
                    debug!(network = %net, error = %err, "cannot attach network");
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    // emulates `docker start`.
    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::Run(trim_extra_info(&e.to_string())))
    }

    // emulates `docker logs -f`, copying container output to the writer
    // until the container stops.
    fn tail(&self, id: &str, output: Arc<dyn LogWriter>) -> JoinHandle<()> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(chunk) => {
                        output.write(&chunk.into_bytes());
                    }
                    Err(err) => {
                        trace!(error = %err, "log stream ended");
                        return;
                    }
                }
            }
        })
    }

    // emulates `docker wait`, blocking until the container stops and
    // returning the exit state.
    async fn wait(&self, id: &str) -> Result<RunState, EngineError> {
        let mut stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        // drain the wait response; the authoritative state comes from
        // inspect below.
        let _ = stream.next().await;

        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| EngineError::Run(trim_extra_info(&e.to_string())))?;

        let state = info.state.unwrap_or_default();
        Ok(RunState {
            exited: !state.running.unwrap_or(false),
            exit_code: state.exit_code.unwrap_or(0),
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    // retries the wait until the engine reports an exited container,
    // guarding against spurious wake-ups.
    async fn wait_retry(&self, id: &str, cancel: &CancelToken) -> Result<RunState, EngineError> {
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Canceled);
            }
            let state = tokio::select! {
                state = self.wait(id) => state?,
                _ = cancel.cancelled() => return Err(EngineError::Canceled),
            };
            if state.exited {
                return Ok(state);
            }
            trace!(container = %id, "docker wait exited unexpectedly");
        }
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn setup(&self, spec: &Spec) -> Result<(), EngineError> {
        // create the temporary volumes mounted into each step.
        for volume in &spec.volumes {
            let Some(empty_dir) = &volume.empty_dir else {
                continue;
            };
            // in-memory volumes are backed by tmpfs mounts and have no
            // volume object.
            if empty_dir.medium == "memory" {
                continue;
            }
            self.docker
                .create_volume(CreateVolumeOptions {
                    name: empty_dir.id.clone(),
                    driver: "local".to_string(),
                    labels: empty_dir.labels.clone(),
                    ..Default::default()
                })
                .await
                .map_err(|e| EngineError::Setup(trim_extra_info(&e.to_string())))?;
        }

        // create the stage network. all containers attach to it.
        let driver = if spec.platform.os == "windows" {
            "nat"
        } else {
            "bridge"
        };
        self.docker
            .create_network(CreateNetworkOptions {
                name: spec.network.id.clone(),
                driver: driver.to_string(),
                options: spec.network.options.clone(),
                labels: spec.network.labels.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::Setup(trim_extra_info(&e.to_string())))?;

        // launch the internal setup steps.
        for step in &spec.internal {
            let discard: Arc<dyn LogWriter> = Arc::new(Discard);
            if let Err(err) = self.create(spec, step, &discard).await {
                debug!(container = %step.id, error = %err, "cannot create internal container");
                return Err(err);
            }
            if let Err(err) = self.start(&step.id).await {
                debug!(container = %step.id, error = %err, "cannot start internal container");
                return Err(err);
            }
            if !step.detach {
                let wait = self.wait(&step.id);
                if tokio::time::timeout(INTERNAL_STEP_TIMEOUT, wait).await.is_err() {
                    debug!(container = %step.id, "internal container timed out");
                }
            }
        }

        Ok(())
    }

    async fn run(
        &self,
        spec: &Spec,
        step: &Step,
        output: Arc<dyn LogWriter>,
        cancel: CancelToken,
    ) -> Result<RunState, EngineError> {
        // a step may not run with unresolved secrets when the spec
        // requires them.
        if spec.secrets_required {
            let missing = step.missing_secrets();
            if !missing.is_empty() {
                return Err(EngineError::MissingSecrets(
                    missing.into_iter().map(String::from).collect(),
                ));
            }
        }

        self.create(spec, step, &output).await?;
        self.start(&step.id).await?;
        let tail = self.tail(&step.id, Arc::clone(&output));
        let state = self.wait_retry(&step.id, &cancel).await;

        // the run must not return before the stream is flushed.
        if state.is_ok() {
            let _ = tail.await;
        } else {
            tail.abort();
        }

        state
    }

    async fn destroy(&self, spec: &Spec) -> Result<(), EngineError> {
        // stop all containers.
        for step in spec.steps.iter().chain(spec.internal.iter()) {
            if let Err(err) = self
                .docker
                .kill_container(
                    &step.id,
                    Some(KillContainerOptions {
                        signal: "SIGKILL".to_string(),
                    }),
                )
                .await
            {
                debug!(container = %step.id, error = %err, "cannot kill container");
            }
        }

        // remove all containers.
        for step in spec.steps.iter().chain(spec.internal.iter()) {
            if let Err(err) = self
                .docker
                .remove_container(
                    &step.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                debug!(container = %step.id, error = %err, "cannot remove container");
            }
        }

        // remove all volumes. tmpfs volumes have no volume entry and
        // need no removal.
        for volume in &spec.volumes {
            let Some(empty_dir) = &volume.empty_dir else {
                continue;
            };
            if empty_dir.medium == "memory" {
                continue;
            }
            if let Err(err) = self
                .docker
                .remove_volume(&empty_dir.id, Some(RemoveVolumeOptions { force: true }))
                .await
            {
                debug!(volume = %empty_dir.id, error = %err, "cannot remove volume");
            }
        }

        // remove the network.
        if let Err(err) = self.docker.remove_network(&spec.network.id).await {
            debug!(network = %spec.network.id, error = %err, "cannot remove network");
        }

        // cleanup failures are silently ignored; a periodic prune on the
        // host reclaims anything left behind.
        Ok(())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unreachable(e.to_string()))
    }
}

struct Discard;

impl LogWriter for Discard {
    fn write(&self, p: &[u8]) -> usize {
        p.len()
    }
}

fn is_not_found(err: &bollard_next::errors::Error) -> bool {
    matches!(
        err,
        bollard_next::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

// builds the container configuration.
fn to_config(spec: &Spec, step: &Step) -> Config {
    let mut envs: Vec<String> = step.envs.iter().map(|(k, v)| format!("{k}={v}")).collect();
    for secret in &step.secrets {
        if !secret.env.is_empty() {
            envs.push(format!("{}={}", secret.env, secret.value()));
        }
    }
    envs.sort();

    Config {
        image: Some(step.image.clone()),
        env: Some(envs),
        cmd: none_if_empty(step.command.clone()),
        entrypoint: none_if_empty(step.entrypoint.clone()),
        labels: Some(step.labels.clone()),
        user: if step.user.is_empty() {
            None
        } else {
            Some(step.user.clone())
        },
        working_dir: if step.working_dir.is_empty() {
            None
        } else {
            Some(step.working_dir.clone())
        },
        host_config: Some(to_host_config(spec, step)),
        networking_config: to_network_config(spec, step),
        ..Default::default()
    }
}

// builds the host configuration: binds, tmpfs, devices, resources and
// the network mode.
fn to_host_config(spec: &Spec, step: &Step) -> HostConfig {
    let mut binds = Vec::new();
    let mut tmpfs: HashMap<String, String> = HashMap::new();

    for mount in &step.volumes {
        let Some(volume) = lookup_volume(spec, &mount.name) else {
            continue;
        };
        if let Some(empty_dir) = &volume.empty_dir {
            if empty_dir.medium == "memory" {
                let mut opts = String::new();
                if empty_dir.size_limit > 0 {
                    opts = format!("size={}", empty_dir.size_limit);
                }
                tmpfs.insert(mount.path.clone(), opts);
            } else {
                binds.push(format!("{}:{}", empty_dir.id, mount.path));
            }
        } else if let Some(host_path) = &volume.host_path {
            let suffix = if host_path.read_only { ":ro" } else { "" };
            binds.push(format!("{}:{}{}", host_path.path, mount.path, suffix));
        }
    }

    let devices: Vec<DeviceMapping> = step
        .devices
        .iter()
        .map(|device| DeviceMapping {
            path_on_host: Some(device.name.clone()),
            path_in_container: Some(device.device_path.clone()),
            cgroup_permissions: Some("rwm".to_string()),
        })
        .collect();

    HostConfig {
        binds: none_if_empty(binds),
        devices: none_if_empty(devices),
        dns: none_if_empty(step.dns.clone()),
        dns_search: none_if_empty(step.dns_search.clone()),
        extra_hosts: none_if_empty(step.extra_hosts.clone()),
        privileged: Some(step.privileged),
        memory: positive(step.mem_limit),
        memory_swap: positive(step.memswap_limit),
        shm_size: positive(step.shm_size),
        cpu_period: positive(step.cpu_period),
        cpu_quota: positive(step.cpu_quota),
        cpu_shares: positive(step.cpu_shares),
        cpuset_cpus: if step.cpu_set.is_empty() {
            None
        } else {
            Some(step.cpu_set.join(","))
        },
        network_mode: if step.network.is_empty() {
            None
        } else {
            Some(step.network.clone())
        },
        tmpfs: if tmpfs.is_empty() { None } else { Some(tmpfs) },
        ..Default::default()
    }
}

// attaches the container to the stage network under the step name so
// services resolve by hostname.
fn to_network_config(spec: &Spec, step: &Step) -> Option<NetworkingConfig<String>> {
    if !step.network.is_empty() || spec.network.id.is_empty() {
        return None;
    }
    let endpoint = EndpointSettings {
        aliases: Some(vec![step.name.clone()]),
        ..Default::default()
    };
    Some(NetworkingConfig {
        endpoints_config: HashMap::from([(spec.network.id.clone(), endpoint)]),
    })
}

fn lookup_volume<'a>(spec: &'a Spec, name: &str) -> Option<&'a Volume> {
    spec.volumes.iter().find(|v| {
        v.empty_dir.as_ref().map(|e| e.name.as_str()) == Some(name)
            || v.host_path.as_ref().map(|h| h.name.as_str()) == Some(name)
    })
}

fn none_if_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn positive(v: i64) -> Option<i64> {
    if v > 0 {
        Some(v)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hodei_runner_core::spec::{Network, Secret, VolumeEmptyDir, VolumeHostPath, VolumeMount};

    fn spec_with_volumes() -> Spec {
        Spec {
            network: Network {
                id: "hodei-net".to_string(),
                ..Default::default()
            },
            volumes: vec![
                Volume {
                    empty_dir: Some(VolumeEmptyDir {
                        id: "hodei-vol".to_string(),
                        name: "_workspace".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    empty_dir: Some(VolumeEmptyDir {
                        id: "hodei-cache".to_string(),
                        name: "cache".to_string(),
                        medium: "memory".to_string(),
                        size_limit: 1024,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    host_path: Some(VolumeHostPath {
                        id: "hodei-sock".to_string(),
                        name: "docker".to_string(),
                        path: "/var/run/docker.sock".to_string(),
                        read_only: true,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn step_with_mounts() -> Step {
        Step {
            id: "hodei-step".to_string(),
            name: "build".to_string(),
            image: "golang:1.21".to_string(),
            volumes: vec![
                VolumeMount {
                    name: "_workspace".to_string(),
                    path: "/drone/src".to_string(),
                },
                VolumeMount {
                    name: "cache".to_string(),
                    path: "/cache".to_string(),
                },
                VolumeMount {
                    name: "docker".to_string(),
                    path: "/var/run/docker.sock".to_string(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_host_config_binds_and_tmpfs() {
        let spec = spec_with_volumes();
        let host = to_host_config(&spec, &step_with_mounts());
        let binds = host.binds.unwrap();
        assert!(binds.contains(&"hodei-vol:/drone/src".to_string()));
        assert!(binds.contains(&"/var/run/docker.sock:/var/run/docker.sock:ro".to_string()));
        let tmpfs = host.tmpfs.unwrap();
        assert_eq!(tmpfs["/cache"], "size=1024");
    }

    #[test]
    fn test_config_env_includes_secrets() {
        let spec = spec_with_volumes();
        let mut step = step_with_mounts();
        step.envs.insert("GOOS".to_string(), "linux".to_string());
        step.secrets.push(Secret {
            name: "token".to_string(),
            env: "TOKEN".to_string(),
            data: b"value".to_vec(),
            mask: true,
        });
        let config = to_config(&spec, &step);
        let envs = config.env.unwrap();
        assert!(envs.contains(&"GOOS=linux".to_string()));
        assert!(envs.contains(&"TOKEN=value".to_string()));
    }

    #[test]
    fn test_network_alias_is_step_name() {
        let spec = spec_with_volumes();
        let step = step_with_mounts();
        let net = to_network_config(&spec, &step).unwrap();
        let endpoint = &net.endpoints_config["hodei-net"];
        assert_eq!(endpoint.aliases.as_ref().unwrap()[0], "build");
    }

    #[test]
    fn test_custom_network_mode_skips_stage_network() {
        let spec = spec_with_volumes();
        let mut step = step_with_mounts();
        step.network = "host".to_string();
        assert!(to_network_config(&spec, &step).is_none());
        let host = to_host_config(&spec, &step);
        assert_eq!(host.network_mode.unwrap(), "host");
    }

    #[test]
    fn test_resource_limits_applied() {
        let spec = spec_with_volumes();
        let mut step = step_with_mounts();
        step.mem_limit = 512;
        step.cpu_shares = 2;
        step.cpu_set = vec!["0".to_string(), "1".to_string()];
        let host = to_host_config(&spec, &step);
        assert_eq!(host.memory.unwrap(), 512);
        assert_eq!(host.cpu_shares.unwrap(), 2);
        assert_eq!(host.cpuset_cpus.unwrap(), "0,1");
        assert_eq!(host.memory_swap, None);
    }
}
