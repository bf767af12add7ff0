//! Pipeline expansion and normalization.
//!
//! Runs before compilation: matrix strategies fan out into concrete
//! steps, `${{ … }}` templates in user-facing fields resolve against the
//! build context, and steps without a name receive a generated one.

use serde_json::json;
use serde_json::Value as Context;

use hodei_runner_core::resource::{EnvValue, Pipeline, Step};
use hodei_runner_core::{Build, Repo};

use crate::script;

/// Builds the template context exposed to `${{ … }}` expressions.
pub fn inputs(build: &Build, repo: &Repo) -> Context {
    json!({
        "build": {
            "number": build.number,
            "event": build.event,
            "action": build.action,
            "branch": build.target,
            "source": build.source,
            "target": build.target,
            "ref": build.git_ref,
            "commit": build.after,
            "message": build.message,
            "author": build.author_login,
        },
        "repo": {
            "name": repo.name,
            "namespace": repo.namespace,
            "slug": repo.slug,
            "branch": repo.branch,
            "private": repo.private,
        },
    })
}

/// Expands matrix strategies and resolves templates in the pipeline.
pub fn expand(pipeline: &mut Pipeline, inputs: &Context) {
    pipeline.name = script::expand(&pipeline.name, inputs);

    let steps = std::mem::take(&mut pipeline.steps);
    for step in steps {
        pipeline.steps.extend(fan_out(step, inputs));
    }

    let services = std::mem::take(&mut pipeline.services);
    for service in services {
        pipeline.services.extend(fan_out(service, inputs));
    }
}

/// Assigns generated names to steps that lack them.
pub fn normalize(pipeline: &mut Pipeline) {
    for (index, step) in pipeline.steps.iter_mut().enumerate() {
        if step.name.is_empty() {
            step.name = format!("step-{}", index + 1);
        }
    }
    for (index, service) in pipeline.services.iter_mut().enumerate() {
        if service.name.is_empty() {
            service.name = format!("service-{}", index + 1);
        }
    }
}

fn fan_out(step: Step, inputs: &Context) -> Vec<Step> {
    let axes = step
        .strategy
        .as_ref()
        .map(|s| s.matrix.clone())
        .unwrap_or_default();

    if axes.is_empty() {
        let mut single = step;
        expand_step(&mut single, inputs);
        return vec![single];
    }

    axes.into_iter()
        .map(|axis| {
            let mut copy = step.clone();
            copy.strategy = None;
            let mut ctx = inputs.clone();
            if let Some(map) = ctx.as_object_mut() {
                map.insert(
                    "matrix".to_string(),
                    serde_json::to_value(&axis).unwrap_or_default(),
                );
            }
            expand_step(&mut copy, &ctx);
            copy
        })
        .collect()
}

fn expand_step(step: &mut Step, inputs: &Context) {
    step.name = script::expand(&step.name, inputs);
    step.image = script::expand(&step.image, inputs);
    for command in step.commands.iter_mut() {
        *command = script::expand(command, inputs);
    }
    for command in step.command.iter_mut() {
        *command = script::expand(command, inputs);
    }
    for value in step.environment.values_mut() {
        if let EnvValue::Literal(text) = value {
            *text = script::expand(text, inputs);
        }
    }
}
