//! DAG execer.
//!
//! Executes the compiled Spec step by step: one task per step, gated on
//! its predecessors' completion, with an optional counting semaphore
//! bounding concurrency. Run policies are evaluated at dispatch time,
//! error policies on exit. Cancellation (remote, timeout or fail-fast)
//! propagates to in-flight runs, while destroy always runs to completion
//! afterwards.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use hodei_runner_core::spec::{Spec, Step};
use hodei_runner_core::{environ, CancelToken, DomainError, ErrPolicy, RunPolicy, State};
use hodei_runner_ports::{CardUploader, Engine, EngineError, Reporter, StepStream, Streamer};

use crate::card::CardExtractor;
use crate::dag::Dag;
use crate::replacer::mask_writer;

/// Executes the intermediate representation of the pipeline.
#[derive(Clone)]
pub struct Execer {
    engine: Arc<dyn Engine>,
    reporter: Arc<dyn Reporter>,
    streamer: Arc<dyn Streamer>,
    uploader: Option<Arc<dyn CardUploader>>,
    sem: Option<Arc<Semaphore>>,
}

impl Execer {
    /// Returns a new execer. A non-zero `threads` bounds the number of
    /// steps that may run concurrently.
    pub fn new(
        engine: Arc<dyn Engine>,
        reporter: Arc<dyn Reporter>,
        streamer: Arc<dyn Streamer>,
        threads: usize,
    ) -> Self {
        Self {
            engine,
            reporter,
            streamer,
            uploader: None,
            sem: (threads > 0).then(|| Arc::new(Semaphore::new(threads))),
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn CardUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Executes the pipeline and returns when every step has reached a
    /// terminal state and the environment has been destroyed.
    pub async fn exec(
        &self,
        spec: Arc<Spec>,
        state: Arc<State>,
        cancel: CancelToken,
    ) -> Result<(), DomainError> {
        let result = self.exec_inner(&spec, &state, &cancel).await;

        debug!("destroying the pipeline environment");
        match self.engine.destroy(&spec).await {
            Ok(()) => debug!("successfully destroyed the pipeline environment"),
            Err(err) => debug!(error = %err, "cannot destroy the pipeline environment"),
        }

        result
    }

    async fn exec_inner(
        &self,
        spec: &Arc<Spec>,
        state: &Arc<State>,
        cancel: &CancelToken,
    ) -> Result<(), DomainError> {
        if let Err(err) = self.engine.setup(spec).await {
            debug!(error = %err, "failed to setup the pipeline environment");
            state.fail_all(&err.to_string());
            self.report_stage(state).await;
            return Ok(());
        }

        let dag = match Dag::build(&spec.steps) {
            Ok(dag) => dag,
            Err(err) => {
                warn!(error = %err, "invalid execution graph");
                state.fail_all(&err.to_string());
                self.report_stage(state).await;
                return Err(err);
            }
        };

        let total = dag.len();
        let mut finished = vec![false; total];
        let mut spawned = vec![false; total];
        let mut task_ids: std::collections::HashMap<tokio::task::Id, usize> =
            std::collections::HashMap::new();
        let mut tasks: JoinSet<usize> = JoinSet::new();

        loop {
            for index in 0..total {
                if spawned[index] {
                    continue;
                }
                if !dag.predecessors(index).iter().all(|&p| finished[p]) {
                    continue;
                }
                spawned[index] = true;
                let execer = self.clone();
                let spec = Arc::clone(spec);
                let state = Arc::clone(state);
                let cancel = cancel.clone();
                let handle = tasks.spawn(async move {
                    let step = &spec.steps[index];
                    execer.run_step(&spec, step, &state, &cancel).await;

                    // a fail-fast step that exited non-zero cancels the
                    // entire stage.
                    if step.err_policy == ErrPolicy::FailFast
                        && state.exit_code(&step.name) > 0
                    {
                        debug!(step = %step.name, "fail-fast triggered");
                        cancel.cancel();
                    }
                    index
                });
                task_ids.insert(handle.id(), index);
            }

            match tasks.join_next_with_id().await {
                Some(Ok((_, index))) => finished[index] = true,
                Some(Err(err)) => {
                    // a panicked task must not deadlock the scheduler
                    warn!(error = %err, "step task failed");
                    if let Some(&index) = task_ids.get(&err.id()) {
                        finished[index] = true;
                    }
                }
                None => break,
            }
        }

        state.finish_all();
        self.report_stage(state).await;
        Ok(())
    }

    async fn run_step(
        &self,
        spec: &Arc<Spec>,
        step: &Step,
        state: &Arc<State>,
        cancel: &CancelToken,
    ) {
        if cancel.is_cancelled() {
            state.cancel();
            return;
        }

        // the optional semaphore bounds concurrently-running steps.
        // waiting on it is itself cancellable.
        let _permit = match &self.sem {
            Some(sem) => {
                tokio::select! {
                    permit = Arc::clone(sem).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(err) => {
                            warn!(error = %err, "failed to acquire semaphore");
                            return;
                        }
                    },
                    _ = cancel.cancelled() => {
                        state.cancel();
                        return;
                    }
                }
            }
            None => None,
        };

        match step.run_policy {
            _ if state.cancelled() => return,
            RunPolicy::Never => return,
            RunPolicy::Always => {}
            RunPolicy::OnFailure if !state.failed() => {
                state.skip(&step.name);
                self.report_step(state, &step.name).await;
                return;
            }
            RunPolicy::OnSuccess if state.failed() => {
                state.skip(&step.name);
                self.report_step(state, &step.name).await;
                return;
            }
            _ if state.finished(&step.name) => return,
            _ => {}
        }

        state.start(&step.name);
        self.report_step(state, &step.name).await;

        // clone the step and refresh its environment with the current
        // build and stage state; the shared spec is never mutated.
        let mut copy = step.clone_for_run();
        {
            let (build, _repo, stage, _system) = state.context();
            let step_record = state.step(&step.name).unwrap_or_default();
            copy.envs = environ::combine(&[
                &copy.envs,
                &environ::build(&build),
                &environ::stage(&stage),
                &environ::step(&step_record),
            ]);
        }

        let step_record = state.step(&step.name).unwrap_or_default();
        let stream = self.streamer.stream(step_record.number, &step.name).await;
        let masked = mask_writer(stream, &step.secrets);
        let extractor = CardExtractor::new(masked);

        // detached steps do not block successors; the run is spawned in
        // the background and killed at destroy.
        if step.detach {
            let engine = Arc::clone(&self.engine);
            let spec = Arc::clone(spec);
            let cancel = cancel.clone();
            let writer = Arc::clone(&extractor);
            tokio::spawn(async move {
                let output = writer.clone() as Arc<dyn hodei_runner_ports::LogWriter>;
                let _ = engine.run(&spec, &copy, output, cancel).await;
                writer.close().await;
            });
            return;
        }

        let output = Arc::clone(&extractor) as Arc<dyn hodei_runner_ports::LogWriter>;
        let result = self
            .engine
            .run(spec, &copy, output, cancel.clone())
            .await;

        // close the stream; the full log buffer uploads to the sink.
        extractor.close().await;

        if let Some(card) = extractor.file() {
            if let Some(uploader) = &self.uploader {
                uploader.upload_card(&step.name, &card).await;
            }
        }

        match result {
            Ok(exited) => {
                if cancel.is_cancelled() {
                    state.cancel();
                    return;
                }
                if exited.oom_killed {
                    debug!(step = %step.name, "received oom kill");
                    state.finish(&step.name, 137);
                } else {
                    debug!(step = %step.name, code = exited.exit_code, "received exit code");
                    state.finish(&step.name, exited.exit_code);
                }
                self.report_step(state, &step.name).await;
                // exit code 78 skips all subsequent pending steps.
                if exited.exit_code == 78 {
                    debug!(step = %step.name, "received exit code 78, early exit");
                    state.skip_all();
                }
            }
            Err(EngineError::Canceled) => {
                state.cancel();
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    state.cancel();
                    return;
                }
                // an internal error, as opposed to a runtime error,
                // places the step in the error state.
                state.fail(&step.name, &err.to_string());
                self.report_step(state, &step.name).await;
            }
        }
    }

    async fn report_stage(&self, state: &State) {
        if let Err(err) = self.reporter.report_stage(state).await {
            warn!(error = %err, "cannot report stage status");
        }
    }

    async fn report_step(&self, state: &State, name: &str) {
        if let Err(err) = self.reporter.report_step(state, name).await {
            warn!(step = %name, error = %err, "cannot report step status");
        }
    }
}
