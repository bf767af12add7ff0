//! Stage runner.
//!
//! Top-level driver for a stage assignment: claims ownership from the
//! coordinator, parses and normalizes the configuration, compiles it,
//! registers the visible steps, and hands the plan to the execer while
//! watching for remote cancellation and the stage timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use hodei_runner_compiler::{linter, normalize, Args, Compiler};
use hodei_runner_core::resource::Pipeline;
use hodei_runner_core::{status, CancelToken, DomainError, RunPolicy, StageStep, State};
use hodei_runner_core::{Stage, StageSecret};
use hodei_runner_ports::{
    ClientError, CoordinatorClient, Reporter, SecretProvider, SecretRequest,
};

use crate::execer::Execer;

/// Secrets delivered with the stage detail, exposed as a provider so the
/// compiler resolves them ahead of the global providers.
struct StageSecrets(HashMap<String, String>);

impl StageSecrets {
    fn new(secrets: &[StageSecret]) -> Self {
        Self(
            secrets
                .iter()
                .map(|s| (s.name.clone(), s.data.clone()))
                .collect(),
        )
    }
}

#[async_trait]
impl SecretProvider for StageSecrets {
    async fn find(&self, req: &SecretRequest) -> Result<Option<String>, String> {
        Ok(self.0.get(&req.name).cloned())
    }
}

/// Runs pipeline stages assigned by the coordinator.
pub struct Runner {
    /// Name of the host machine executing the pipeline.
    pub machine: String,
    pub client: Arc<dyn CoordinatorClient>,
    pub compiler: Arc<Compiler>,
    pub reporter: Arc<dyn Reporter>,
    pub execer: Execer,
}

impl Runner {
    /// Runs the pipeline stage to completion.
    pub async fn run(&self, mut stage: Stage) -> Result<(), DomainError> {
        debug!(stage.id = stage.id, stage.name = %stage.name, "stage received");

        // delivery to a single runner is not guaranteed; the first
        // runner that confirms receipt assumes ownership.
        stage.machine = self.machine.clone();
        match self.client.accept(&stage).await {
            Ok(()) => debug!(stage.id = stage.id, "stage accepted"),
            Err(ClientError::OptimisticLock) => {
                debug!(stage.id = stage.id, "stage accepted by another runner");
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, "cannot accept stage");
                return Err(DomainError::Infrastructure(err.to_string()));
            }
        }

        let ctx = self
            .client
            .detail(&stage)
            .await
            .map_err(|err| DomainError::Infrastructure(err.to_string()))?;

        debug!(
            repo.name = %ctx.repo.name,
            build.number = ctx.build.number,
            "stage details fetched"
        );

        let state = Arc::new(State::new(
            ctx.build.clone(),
            ctx.repo.clone(),
            stage.clone(),
            ctx.system.clone(),
        ));

        // pre-v1 documents are detected by a prefix sniff and skip
        // expansion and normalization.
        let legacy = is_legacy(&ctx.config);

        let parsed = if legacy {
            parse_legacy(&ctx.config)
        } else {
            serde_yaml::from_str(&ctx.config)
        };
        let mut pipeline: Pipeline = match parsed {
            Ok(pipeline) => pipeline,
            Err(err) => {
                error!(error = %err, "cannot parse configuration file");
                state.fail_all(&err.to_string());
                return self.report_stage(&state).await;
            }
        };

        if !legacy {
            let inputs = normalize::inputs(&ctx.build, &ctx.repo);
            normalize::expand(&mut pipeline, &inputs);
            normalize::normalize(&mut pipeline);
        }

        if let Err(err) = linter::lint(
            &pipeline,
            linter::Opts {
                trusted: ctx.repo.trusted,
            },
        ) {
            error!(error = %err, "linting the pipeline failed");
            state.fail_all(&err.to_string());
            return self.report_stage(&state).await;
        }

        let args = Args {
            pipeline: Arc::new(pipeline),
            build: ctx.build.clone(),
            repo: ctx.repo.clone(),
            stage: stage.clone(),
            system: ctx.system.clone(),
            netrc: ctx.netrc.clone(),
            secret: Some(Arc::new(StageSecrets::new(&ctx.secrets))),
        };

        let spec = match self.compiler.compile(&args).await {
            Ok(spec) => Arc::new(spec),
            Err(err) => {
                error!(error = %err, "cannot compile the pipeline");
                state.fail_all(&err.to_string());
                return self.report_stage(&state).await;
            }
        };

        // steps that never run are not registered with the coordinator
        // nor displayed in the UI.
        let mut steps = Vec::new();
        for src in spec.steps.iter().filter(|s| s.run_policy != RunPolicy::Never) {
            steps.push(StageStep {
                name: src.name.clone(),
                number: steps.len() as i64 + 1,
                stage_id: stage.id,
                status: status::PENDING.to_string(),
                errignore: src.err_policy == hodei_runner_core::ErrPolicy::Ignore,
                image: src.image.clone(),
                detached: src.detach,
                depends_on: src.depends_on.clone(),
                ..Default::default()
            });
        }
        stage.steps = steps.clone();
        state.set_steps(steps);

        state.set_stage_status(status::RUNNING);
        stage.status = status::RUNNING.to_string();
        stage.started = chrono::Utc::now().timestamp();
        if let Err(err) = self.client.update(&stage).await {
            error!(error = %err, "cannot update stage");
            return Err(DomainError::Infrastructure(err.to_string()));
        }
        debug!("updated stage to running");

        let cancel = CancelToken::new();

        // enforce the per-stage timeout derived from the repository.
        let timeout = Duration::from_secs(ctx.repo.timeout.max(1) as u64 * 60);
        let timeout_cancel = cancel.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!("stage timeout exceeded");
            timeout_cancel.cancel();
        });

        // watch for remote cancellation of the build.
        let watch_cancel = cancel.clone();
        let watch_client = Arc::clone(&self.client);
        let build_id = ctx.build.id;
        let watch_task = tokio::spawn(async move {
            match watch_client.watch(build_id).await {
                Ok(true) => {
                    debug!("received remote cancellation");
                    watch_cancel.cancel();
                }
                Ok(false) => debug!("done listening for cancellations"),
                Err(err) => debug!(error = %err, "cancellation watcher failed"),
            }
        });

        let result = self.execer.exec(spec, Arc::clone(&state), cancel).await;

        timeout_task.abort();
        watch_task.abort();

        let final_stage = state.stage();
        info!(
            stage.id = stage.id,
            status = %final_stage.status,
            "stage execution complete"
        );
        if let Err(err) = self.client.update(&final_stage).await {
            error!(error = %err, "cannot update stage to complete");
        }

        result
    }

    async fn report_stage(&self, state: &State) -> Result<(), DomainError> {
        self.reporter
            .report_stage(state)
            .await
            .map_err(|err| DomainError::Infrastructure(err.to_string()))
    }
}

// pre-v1 configuration documents start with a `pipeline:` mapping, the
// v1 format opens with `spec:`.
fn is_legacy(config: &str) -> bool {
    for line in config.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("---") {
            continue;
        }
        return trimmed.starts_with("pipeline:");
    }
    false
}

// legacy documents declare steps as a named map under the `pipeline`
// key. The map is rewritten into the ordered step list of the current
// document shape before decoding.
fn parse_legacy(config: &str) -> Result<Pipeline, serde_yaml::Error> {
    let doc: serde_yaml::Value = serde_yaml::from_str(config)?;
    let steps_by_name = match doc.get("pipeline") {
        Some(serde_yaml::Value::Mapping(mapping)) => mapping.clone(),
        _ => return serde_yaml::from_value(doc),
    };

    let mut steps = Vec::new();
    for (name, step) in &steps_by_name {
        let mut step = step.clone();
        if let serde_yaml::Value::Mapping(mapping) = &mut step {
            mapping.insert(serde_yaml::Value::from("name"), name.clone());
        }
        steps.push(step);
    }

    let mut root = serde_yaml::Mapping::new();
    if let Some(name) = doc.get("name") {
        root.insert(serde_yaml::Value::from("name"), name.clone());
    }
    for key in ["platform", "clone", "workspace", "volumes", "services"] {
        if let Some(value) = doc.get(key) {
            root.insert(serde_yaml::Value::from(key), value.clone());
        }
    }
    root.insert(
        serde_yaml::Value::from("steps"),
        serde_yaml::Value::Sequence(steps),
    );
    serde_yaml::from_value(serde_yaml::Value::Mapping(root))
}
