//! Compile command.
//!
//! Compiles a local pipeline file and prints the execution plan as JSON.
//! Useful for inspecting what the runner would execute without touching
//! the docker engine.

use std::sync::Arc;

use clap::Args;
use tracing::error;

use hodei_runner_adapters::Config;
use hodei_runner_compiler::{linter, normalize, Args as CompilerArgs};
use hodei_runner_core::resource::Pipeline;
use hodei_runner_core::{Build, Netrc, Repo, Stage, System};

use crate::exec_cmd::compiler_from_config;

#[derive(Args)]
pub struct CompileArgs {
    /// Path to the pipeline file.
    #[arg(default_value = ".drone.yml")]
    pub source: String,

    /// Treat the repository as trusted.
    #[arg(long)]
    pub trusted: bool,
}

pub async fn run(args: CompileArgs) -> i32 {
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
        event: "push".to_string(),
        ..Default::default()
    };
    let repo = Repo {
        trusted: args.trusted,
        timeout: 60,
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

    let compiler = compiler_from_config(&config, config.runner.secrets.clone());
    let compiler_args = CompilerArgs {
        pipeline: Arc::new(pipeline),
        build,
        repo,
        stage: Stage::default(),
        system: System::default(),
        netrc: Netrc::default(),
        secret: None,
    };

    match compiler.compile(&compiler_args).await {
        Ok(spec) => {
            match serde_json::to_string_pretty(&spec) {
                Ok(out) => println!("{out}"),
                Err(err) => {
                    error!(error = %err, "cannot serialize the execution plan");
                    return 1;
                }
            }
            0
        }
        Err(err) => {
            error!(error = %err, "cannot compile the pipeline");
            1
        }
    }
}
