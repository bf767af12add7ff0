//! Delegated HTTP control surface.
//!
//! An external controller drives the stage lifecycle through three POST
//! endpoints: `/setup` compiles and stores the stage environment,
//! `/step` executes a single step against the stored stage, `/destroy`
//! tears the environment down and evicts the entry.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use tracing::error;

use hodei_runner_compiler::compiler::random_id;
use hodei_runner_core::spec::{Network, Spec, Step, Volume, VolumeEmptyDir, VolumeMount};
use hodei_runner_core::{CancelToken, Secret};
use hodei_runner_ports::{Engine, StreamWriter};
use hodei_runner_runtime::{mask_writer, LiveLogWriter, StageStorage};

use hodei_runner_adapters::HttpLogStreamClient;

const WORKSPACE_NAME: &str = "_workspace";
const WORKSPACE_PATH: &str = "/drone/src";

/// Shared state for the delegate endpoints.
#[derive(Clone)]
pub struct DelegateState {
    pub engine: Arc<dyn Engine>,
    pub storage: Arc<StageStorage>,
}

/// Builds the delegate router.
pub fn delegate_router(state: DelegateState) -> Router {
    Router::new()
        .route("/setup", post(handle_setup))
        .route("/step", post(handle_step))
        .route("/destroy", post(handle_destroy))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SetupRequest {
    stage_id: String,
    #[serde(default)]
    stage_env: String,
    #[serde(default)]
    secret_env: String,
    #[serde(default)]
    #[allow(dead_code)]
    dump: Value,
}

#[derive(Debug, Deserialize)]
struct ExecStepRequest {
    stage_id: String,
    step_id: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    log_key: String,
    #[serde(default)]
    log_stream_url: String,
    #[serde(default)]
    log_stream_account_id: String,
    #[serde(default)]
    log_stream_token: String,
    #[serde(default)]
    env: String,
    #[serde(default)]
    #[allow(dead_code)]
    dump: Value,
}

#[derive(Debug, Deserialize)]
struct DestroyRequest {
    stage_id: String,
}

// env maps arrive as JSON-encoded strings.
fn parse_env(raw: &str) -> Result<HashMap<String, String>, serde_json::Error> {
    if raw.is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(raw)
}

async fn handle_setup(
    State(state): State<DelegateState>,
    body: String,
) -> Response {
    let Ok(request) = serde_json::from_str::<SetupRequest>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let (Ok(stage_env), Ok(secret_env)) = (
        parse_env(&request.stage_env),
        parse_env(&request.secret_env),
    ) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // the delegated stage owns a workspace volume and a network, like a
    // compiled stage does.
    let spec = Arc::new(Spec {
        volumes: vec![Volume {
            empty_dir: Some(VolumeEmptyDir {
                id: random_id(),
                name: WORKSPACE_NAME.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }],
        network: Network {
            id: random_id(),
            ..Default::default()
        },
        ..Default::default()
    });

    if let Err(err) = state
        .storage
        .store(&request.stage_id, Arc::clone(&spec), stage_env, secret_env)
    {
        error!(stage = %request.stage_id, error = %err, "failed to store stage");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if let Err(err) = state.engine.setup(&spec).await {
        error!(stage = %request.stage_id, error = %err, "cannot setup the docker environment");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    StatusCode::OK.into_response()
}

async fn handle_step(
    State(state): State<DelegateState>,
    body: String,
) -> Response {
    let Ok(request) = serde_json::from_str::<ExecStepRequest>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Ok(env) = parse_env(&request.env) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let Some(entry) = state.storage.get(&request.stage_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut envs = entry.env_vars.clone();
    envs.extend(entry.secret_vars.clone());
    envs.extend(env);

    // the stage's secret values are masked in the step log.
    let secrets: Vec<Secret> = entry
        .secret_vars
        .iter()
        .map(|(name, value)| Secret {
            name: name.clone(),
            env: name.clone(),
            data: value.clone().into_bytes(),
            mask: true,
        })
        .collect();

    let step = Step {
        id: random_id(),
        name: request.step_id.clone(),
        image: request.image.clone(),
        entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
        command: vec![request.command.clone()],
        working_dir: WORKSPACE_PATH.to_string(),
        envs,
        secrets,
        volumes: vec![VolumeMount {
            name: WORKSPACE_NAME.to_string(),
            path: WORKSPACE_PATH.to_string(),
        }],
        ..Default::default()
    };

    let client = Arc::new(HttpLogStreamClient::new(
        request.log_stream_url.clone(),
        request.log_stream_account_id.clone(),
        request.log_stream_token.clone(),
        true,
    ));
    let writer = LiveLogWriter::open(client, request.log_key.clone()).await;
    let masked = mask_writer(writer, &step.secrets);

    let result = state
        .engine
        .run(
            &entry.spec,
            &step,
            Arc::new(StreamWriter(Arc::clone(&masked))),
            CancelToken::new(),
        )
        .await;
    masked.close().await;

    match result {
        Ok(run_state) => (StatusCode::OK, Json(run_state)).into_response(),
        Err(err) => {
            error!(step = %request.step_id, error = %err, "running the step failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn handle_destroy(
    State(state): State<DelegateState>,
    body: String,
) -> Response {
    let Ok(request) = serde_json::from_str::<DestroyRequest>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // the entry is evicted even when destroy fails.
    let entry = state.storage.get(&request.stage_id);
    state.storage.remove(&request.stage_id);

    if let Some(entry) = entry {
        if let Err(err) = state.engine.destroy(&entry.spec).await {
            error!(stage = %request.stage_id, error = %err, "cannot destroy the docker environment");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    StatusCode::OK.into_response()
}
