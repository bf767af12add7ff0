//! Stage state machine.
//!
//! State tracks the point-in-time status of the stage and its steps while
//! the execer runs them. All mutation goes through a single mutex; callers
//! receive snapshots, never references into the guarded data.

use std::sync::Mutex;

use crate::model::{status, Build, Repo, Stage, StageStep, System};

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Default)]
struct StateData {
    build: Build,
    repo: Repo,
    stage: Stage,
    system: System,
    cancelled: bool,
}

/// Mutex-guarded stage state.
#[derive(Debug, Default)]
pub struct State {
    data: Mutex<StateData>,
}

impl State {
    pub fn new(build: Build, repo: Repo, stage: Stage, system: System) -> Self {
        Self {
            data: Mutex::new(StateData {
                build,
                repo,
                stage,
                system,
                cancelled: false,
            }),
        }
    }

    /// Marks the named step as started.
    pub fn start(&self, name: &str) {
        let mut data = self.data.lock().unwrap();
        if let Some(step) = data.stage.steps.iter_mut().find(|s| s.name == name) {
            step.status = status::RUNNING.to_string();
            step.started = unix_now();
        }
    }

    /// Records the exit code of the named step and derives its status.
    pub fn finish(&self, name: &str, exit_code: i64) {
        let mut data = self.data.lock().unwrap();
        if let Some(step) = data.stage.steps.iter_mut().find(|s| s.name == name) {
            if finished(&step.status) {
                return;
            }
            step.exit_code = exit_code;
            step.stopped = unix_now();
            // exit code 78 is the early-exit convention: the step passes
            // and the remaining pipeline is skipped.
            step.status = if exit_code == 0 || exit_code == 78 {
                status::PASSING.to_string()
            } else {
                status::FAILING.to_string()
            };
        }
    }

    /// Marks the named step as errored with a message.
    pub fn fail(&self, name: &str, error: &str) {
        let mut data = self.data.lock().unwrap();
        if let Some(step) = data.stage.steps.iter_mut().find(|s| s.name == name) {
            step.status = status::ERROR.to_string();
            step.error = error.to_string();
            step.stopped = unix_now();
        }
    }

    /// Fails the whole stage: every unfinished step is skipped and the
    /// stage is placed in the error state.
    pub fn fail_all(&self, error: &str) {
        let mut data = self.data.lock().unwrap();
        data.stage.status = status::ERROR.to_string();
        data.stage.error = error.to_string();
        for step in data.stage.steps.iter_mut() {
            if !finished(&step.status) {
                step.status = status::SKIPPED.to_string();
                step.stopped = unix_now();
            }
        }
    }

    /// Marks the named step as skipped.
    pub fn skip(&self, name: &str) {
        let mut data = self.data.lock().unwrap();
        if let Some(step) = data.stage.steps.iter_mut().find(|s| s.name == name) {
            if !finished(&step.status) {
                step.status = status::SKIPPED.to_string();
                step.stopped = unix_now();
            }
        }
    }

    /// Skips every step that has not started yet. Used for the early-exit
    /// convention (exit code 78).
    pub fn skip_all(&self) {
        let mut data = self.data.lock().unwrap();
        for step in data.stage.steps.iter_mut() {
            if step.status == status::PENDING {
                step.status = status::SKIPPED.to_string();
                step.stopped = unix_now();
            }
        }
    }

    /// Cancels the stage: running steps become killed, pending steps
    /// become skipped.
    pub fn cancel(&self) {
        let mut data = self.data.lock().unwrap();
        data.cancelled = true;
        let now = unix_now();
        for step in data.stage.steps.iter_mut() {
            match step.status.as_str() {
                status::RUNNING => {
                    step.status = status::KILLED.to_string();
                    step.stopped = now;
                }
                status::PENDING => {
                    step.status = status::SKIPPED.to_string();
                    step.stopped = now;
                }
                _ => {}
            }
        }
    }

    /// Derives and records the terminal stage status. A genuine step
    /// failure outranks cancellation: a fail-fast stage reports failing,
    /// not killed.
    pub fn finish_all(&self) {
        let mut data = self.data.lock().unwrap();
        data.stage.stopped = unix_now();
        if data.stage.status == status::ERROR {
            return;
        }
        let failed = data
            .stage
            .steps
            .iter()
            .any(|s| (s.status == status::FAILING || s.status == status::ERROR) && !s.errignore);
        data.stage.status = if failed {
            status::FAILING.to_string()
        } else if data.cancelled {
            status::KILLED.to_string()
        } else {
            status::PASSING.to_string()
        };
    }

    /// Reports whether the stage has a failed step (ignored failures do
    /// not count).
    pub fn failed(&self) -> bool {
        let data = self.data.lock().unwrap();
        data.stage.status == status::ERROR
            || data
                .stage
                .steps
                .iter()
                .any(|s| (s.status == status::FAILING || s.status == status::ERROR) && !s.errignore)
    }

    pub fn finished(&self, name: &str) -> bool {
        let data = self.data.lock().unwrap();
        data.stage
            .steps
            .iter()
            .find(|s| s.name == name)
            .map(|s| finished(&s.status))
            .unwrap_or(false)
    }

    pub fn cancelled(&self) -> bool {
        self.data.lock().unwrap().cancelled
    }

    pub fn exit_code(&self, name: &str) -> i64 {
        let data = self.data.lock().unwrap();
        data.stage
            .steps
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.exit_code)
            .unwrap_or(0)
    }

    /// Snapshot of the stage record for reporting.
    pub fn stage(&self) -> Stage {
        self.data.lock().unwrap().stage.clone()
    }

    /// Snapshot of a single step record for reporting.
    pub fn step(&self, name: &str) -> Option<StageStep> {
        let data = self.data.lock().unwrap();
        data.stage.steps.iter().find(|s| s.name == name).cloned()
    }

    /// Snapshots the build/stage context used for per-step environment
    /// injection.
    pub fn context(&self) -> (Build, Repo, Stage, System) {
        let data = self.data.lock().unwrap();
        (
            data.build.clone(),
            data.repo.clone(),
            data.stage.clone(),
            data.system.clone(),
        )
    }

    /// Replaces the step list; the runner calls this after compilation to
    /// register the visible steps.
    pub fn set_steps(&self, steps: Vec<StageStep>) {
        self.data.lock().unwrap().stage.steps = steps;
    }

    pub fn set_stage_status(&self, value: &str) {
        let mut data = self.data.lock().unwrap();
        data.stage.status = value.to_string();
        if value == status::RUNNING {
            data.stage.started = unix_now();
        }
    }
}

fn finished(step_status: &str) -> bool {
    !matches!(step_status, status::PENDING | status::RUNNING)
}
