//! Runner driver scenarios against a mock coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hodei_runner_compiler::Compiler;
use hodei_runner_core::spec::{Spec, Step};
use hodei_runner_core::{status, CancelToken, Repo, Stage, State};
use hodei_runner_ports::{
    ClientError, CoordinatorClient, Engine, EngineError, LogWriter, NopReporter, Reporter,
    RunState, StageContext, StepStream, Streamer,
};
use hodei_runner_runtime::{Execer, Runner};

struct OkEngine;

#[async_trait]
impl Engine for OkEngine {
    async fn setup(&self, _spec: &Spec) -> Result<(), EngineError> {
        Ok(())
    }

    async fn run(
        &self,
        _spec: &Spec,
        _step: &Step,
        _output: Arc<dyn LogWriter>,
        _cancel: CancelToken,
    ) -> Result<RunState, EngineError> {
        Ok(RunState {
            exited: true,
            exit_code: 0,
            oom_killed: false,
        })
    }

    async fn destroy(&self, _spec: &Spec) -> Result<(), EngineError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

struct NullStream;

impl LogWriter for NullStream {
    fn write(&self, p: &[u8]) -> usize {
        p.len()
    }
}

#[async_trait]
impl StepStream for NullStream {
    async fn close(&self) {}
}

struct NullStreamer;

#[async_trait]
impl Streamer for NullStreamer {
    async fn stream(&self, _number: i64, _name: &str) -> Arc<dyn StepStream> {
        Arc::new(NullStream)
    }
}

struct MockCoordinator {
    config: String,
    locked: bool,
    accepts: AtomicUsize,
    updates: Mutex<Vec<Stage>>,
}

impl MockCoordinator {
    fn new(config: &str) -> Arc<Self> {
        Arc::new(Self {
            config: config.to_string(),
            locked: false,
            accepts: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
        })
    }

    fn locked(config: &str) -> Arc<Self> {
        Arc::new(Self {
            config: config.to_string(),
            locked: true,
            accepts: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CoordinatorClient for MockCoordinator {
    async fn accept(&self, _stage: &Stage) -> Result<(), ClientError> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        if self.locked {
            return Err(ClientError::OptimisticLock);
        }
        Ok(())
    }

    async fn detail(&self, stage: &Stage) -> Result<StageContext, ClientError> {
        Ok(StageContext {
            stage: stage.clone(),
            repo: Repo {
                timeout: 60,
                ..Default::default()
            },
            config: self.config.clone(),
            ..Default::default()
        })
    }

    async fn watch(&self, _build_id: i64) -> Result<bool, ClientError> {
        // never cancels; the runner aborts the watcher on completion
        std::future::pending::<()>().await;
        Ok(false)
    }

    async fn update(&self, stage: &Stage) -> Result<(), ClientError> {
        self.updates.lock().unwrap().push(stage.clone());
        Ok(())
    }
}

fn runner(client: Arc<MockCoordinator>, reporter: Arc<dyn Reporter>) -> Runner {
    let engine: Arc<dyn Engine> = Arc::new(OkEngine);
    Runner {
        machine: "test-machine".to_string(),
        client,
        compiler: Arc::new(Compiler::default()),
        reporter: reporter.clone(),
        execer: Execer::new(engine, reporter, Arc::new(NullStreamer), 0),
    }
}

#[tokio::test]
async fn test_runner_happy_path() {
    let config = r#"
kind: pipeline
name: default
steps:
  - name: build
    image: golang
    commands: [go build]
"#;
    let client = MockCoordinator::new(config);
    let runner = runner(client.clone(), Arc::new(NopReporter));

    runner.run(Stage::default()).await.unwrap();

    let updates = client.updates.lock().unwrap();
    // first update: running with registered steps; last: terminal state
    assert!(updates.len() >= 2);
    assert_eq!(updates[0].status, status::RUNNING);
    let names: Vec<&str> = updates[0].steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["clone", "build"]);
    assert_eq!(updates.last().unwrap().status, status::PASSING);
}

#[tokio::test]
async fn test_runner_returns_cleanly_on_lost_lock() {
    let client = MockCoordinator::locked("kind: pipeline\nname: default\n");
    let runner = runner(client.clone(), Arc::new(NopReporter));

    runner.run(Stage::default()).await.unwrap();

    assert_eq!(client.accepts.load(Ordering::SeqCst), 1);
    assert!(client.updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_runner_reports_error_on_unparsable_config() {
    struct CaptureReporter(Mutex<Vec<String>>);

    #[async_trait]
    impl Reporter for CaptureReporter {
        async fn report_stage(&self, state: &State) -> Result<(), ClientError> {
            self.0.lock().unwrap().push(state.stage().status);
            Ok(())
        }

        async fn report_step(&self, _state: &State, _name: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    let client = MockCoordinator::new("steps: [unclosed");
    let reporter = Arc::new(CaptureReporter(Mutex::new(Vec::new())));
    let runner = runner(client, reporter.clone());

    runner.run(Stage::default()).await.unwrap();

    let reported = reporter.0.lock().unwrap();
    assert_eq!(reported.as_slice(), [status::ERROR.to_string()]);
}

#[tokio::test]
async fn test_runner_rejects_linted_pipeline() {
    let config = r#"
kind: pipeline
name: default
steps:
  - name: sneaky
    image: alpine
    privileged: true
"#;
    let client = MockCoordinator::new(config);
    let runner = runner(client.clone(), Arc::new(NopReporter));

    runner.run(Stage::default()).await.unwrap();

    // the stage never transitioned to running
    assert!(client.updates.lock().unwrap().is_empty());
}
