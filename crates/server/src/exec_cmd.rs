//! Exec command.
//!
//! Compiles a local pipeline file and executes it against the docker
//! engine, streaming output to the console. Exits non-zero when the
//! stage ends in a failing, errored or killed state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tracing::error;

use hodei_runner_adapters::docker::Opts;
use hodei_runner_adapters::{Config, DockerEngine, StaticEnvs, StaticRegistry, StaticSecrets};
use hodei_runner_compiler::{linter, normalize, Args as CompilerArgs, Compiler, Resources, Tmate};
use hodei_runner_core::resource::Pipeline;
use hodei_runner_core::{status, Build, CancelToken, ErrPolicy, Netrc, Repo, RunPolicy, Stage, StageStep, State, System};
use hodei_runner_ports::NopReporter;
use hodei_runner_runtime::Execer;

use hodei_runner_server::streams::ConsoleStreamer;

#[derive(Args)]
pub struct ExecArgs {
    /// Path to the pipeline file.
    #[arg(default_value = ".drone.yml")]
    pub source: String,

    /// Treat the repository as trusted.
    #[arg(long)]
    pub trusted: bool,

    /// Stage timeout in minutes.
    #[arg(long, default_value_t = 60)]
    pub timeout: i64,

    /// Branch name presented to the pipeline.
    #[arg(long, default_value = "main")]
    pub branch: String,

    /// Build event presented to the pipeline.
    #[arg(long, default_value = "push")]
    pub event: String,

    /// Secrets in name=value form.
    #[arg(long = "secret", value_name = "NAME=VALUE")]
    pub secrets: Vec<String>,
}

pub async fn run(args: ExecArgs) -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return 1;
        }
    };

    let source = match std::fs::read_to_string(&args.source) {
        Ok(source) => source,
        Err(err) => {
            error!(path = %args.source, error = %err, "cannot read the pipeline file");
            return 1;
        }
    };
    let mut pipeline: Pipeline = match serde_yaml::from_str(&source) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!(error = %err, "cannot parse the pipeline file");
            return 1;
        }
    };

    let build = Build {
        number: 1,
        event: args.event.clone(),
        target: args.branch.clone(),
        status: status::PENDING.to_string(),
        ..Default::default()
    };
    let repo = Repo {
        trusted: args.trusted,
        timeout: args.timeout,
        branch: args.branch.clone(),
        ..Default::default()
    };

    let inputs = normalize::inputs(&build, &repo);
    normalize::expand(&mut pipeline, &inputs);
    normalize::normalize(&mut pipeline);

    if let Err(err) = linter::lint(
        &pipeline,
        linter::Opts {
            trusted: args.trusted,
        },
    ) {
        error!(error = %err, "pipeline validation failed");
        return 1;
    }

    let mut cli_secrets = config.runner.secrets.clone();
    for pair in &args.secrets {
        if let Some((name, value)) = pair.split_once('=') {
            cli_secrets.insert(name.to_string(), value.to_string());
        }
    }

    let compiler = compiler_from_config(&config, cli_secrets);
    let compiler_args = CompilerArgs {
        pipeline: Arc::new(pipeline),
        build,
        repo,
        stage: Stage::default(),
        system: System::default(),
        netrc: Netrc::default(),
        secret: None,
    };
    let spec = match compiler.compile(&compiler_args).await {
        Ok(spec) => Arc::new(spec),
        Err(err) => {
            error!(error = %err, "cannot compile the pipeline");
            return 1;
        }
    };

    let engine = match DockerEngine::new_env(Opts {
        hide_pull: !config.docker.stream_pull,
    }) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            error!(error = %err, "cannot load the docker engine");
            return 1;
        }
    };

    let steps = spec
        .steps
        .iter()
        .filter(|s| s.run_policy != RunPolicy::Never)
        .enumerate()
        .map(|(i, s)| StageStep {
            number: i as i64 + 1,
            name: s.name.clone(),
            status: status::PENDING.to_string(),
            errignore: s.err_policy == ErrPolicy::Ignore,
            detached: s.detach,
            ..Default::default()
        })
        .collect();
    let state = Arc::new(State::new(
        compiler_args.build.clone(),
        compiler_args.repo.clone(),
        Stage {
            steps,
            ..Default::default()
        },
        System::default(),
    ));

    let cancel = CancelToken::new();
    let timeout_cancel = cancel.clone();
    let timeout = Duration::from_secs(args.timeout.max(1) as u64 * 60);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        timeout_cancel.cancel();
    });

    let execer = Execer::new(
        engine,
        Arc::new(NopReporter),
        Arc::new(ConsoleStreamer),
        config.runner.max_procs,
    );
    if let Err(err) = execer.exec(spec, Arc::clone(&state), cancel).await {
        error!(error = %err, "pipeline execution failed");
        return 1;
    }

    match state.stage().status.as_str() {
        status::PASSING => 0,
        _ => 1,
    }
}

pub(crate) fn compiler_from_config(config: &Config, secrets: HashMap<String, String>) -> Compiler {
    let mut compiler = Compiler {
        environ: Some(Arc::new(StaticEnvs::new(config.runner.environ.clone()))),
        labels: config.runner.labels.clone(),
        networks: config.runner.networks.clone(),
        volumes: config.runner.volumes.clone(),
        clone_image: config.runner.clone_image.clone(),
        resources: Resources {
            memory: config.resources.memory,
            memory_swap: config.resources.memory_swap,
            cpu_quota: config.resources.cpu_quota,
            cpu_period: config.resources.cpu_period,
            cpu_shares: config.resources.cpu_shares,
            cpu_set: config.resources.cpu_set.clone(),
            shm_size: config.resources.shm_size,
        },
        secret: Some(Arc::new(StaticSecrets::new(secrets))),
        registry: Some(Arc::new(StaticRegistry::from_file(&config.docker.config))),
        tmate: Tmate {
            enabled: config.tmate.enabled,
            image: config.tmate.image.clone(),
            server: config.tmate.server.clone(),
            port: config.tmate.port.clone(),
            rsa_fingerprint: config.tmate.rsa_fingerprint.clone(),
            ed25519_fingerprint: config.tmate.ed25519_fingerprint.clone(),
            authorized_keys: config.tmate.authorized_keys.clone(),
        },
        netrc_clone_only: config.netrc.clone_only,
        ..Default::default()
    };
    compiler
        .privileged
        .extend(config.runner.privileged_images.iter().cloned());
    compiler
}
