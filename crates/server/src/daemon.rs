//! Daemon command.
//!
//! Connects to the docker engine, blocks until it responds to pings,
//! then serves the delegate control surface.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use hodei_runner_adapters::docker::Opts;
use hodei_runner_adapters::{Config, DockerEngine};
use hodei_runner_ports::Engine;
use hodei_runner_runtime::StageStorage;

use hodei_runner_server::{delegate_router, DelegateState};

#[derive(Args)]
pub struct DaemonArgs {
    /// Optional environment file loaded before configuration.
    #[arg(default_value = "")]
    pub envfile: String,
}

pub async fn run(args: DaemonArgs) -> i32 {
    if !args.envfile.is_empty() {
        load_env_file(&args.envfile);
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
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

    // block until a successful connection to the docker daemon has been
    // established.
    loop {
        match engine.ping().await {
            Ok(()) => {
                debug!("successfully pinged the docker daemon");
                break;
            }
            Err(err) => {
                error!(error = %err, "cannot ping the docker daemon");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    let state = DelegateState {
        engine,
        storage: Arc::new(StageStorage::new()),
    };
    let router = delegate_router(state).layer(TraceLayer::new_for_http());

    let addr = config.server.listen_addr();
    info!(addr = %addr, capacity = config.runner.capacity, "starting the server");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %addr, error = %err, "cannot bind the server address");
            return 1;
        }
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("received signal, terminating process");
    };

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %err, "shutting down the server");
        return 1;
    }
    0
}

fn load_env_file(path: &str) {
    let Ok(data) = std::fs::read_to_string(path) else {
        error!(path = %path, "cannot load the environment variable file");
        return;
    };
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            if std::env::var(k.trim()).is_err() {
                std::env::set_var(k.trim(), v.trim().trim_matches('"'));
            }
        }
    }
}
