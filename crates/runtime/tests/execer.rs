//! End-to-end execer scenarios against a mock engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hodei_runner_core::spec::{Spec, Step};
use hodei_runner_core::{status, Build, CancelToken, ErrPolicy, Repo, RunPolicy, Stage, StageStep, State, System};
use hodei_runner_ports::{
    Engine, EngineError, LogWriter, NopReporter, RunState, StepStream, Streamer,
};
use hodei_runner_runtime::Execer;

/// Scripted engine behavior for a single step.
#[derive(Clone)]
enum Behavior {
    Exit(i64),
    OomKill,
    /// Writes the payload to the step log, then exits.
    Write(&'static [u8], i64),
    /// Blocks until the stage is cancelled.
    Hang,
    Error(&'static str),
}

struct MockEngine {
    behaviors: HashMap<String, Behavior>,
    setup_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    runs: Mutex<Vec<String>>,
}

impl MockEngine {
    fn new(behaviors: HashMap<String, Behavior>) -> Arc<Self> {
        Arc::new(Self {
            behaviors,
            setup_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            runs: Mutex::new(Vec::new()),
        })
    }

    fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn setup(&self, _spec: &Spec) -> Result<(), EngineError> {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(
        &self,
        _spec: &Spec,
        step: &Step,
        output: Arc<dyn LogWriter>,
        cancel: CancelToken,
    ) -> Result<RunState, EngineError> {
        self.runs.lock().unwrap().push(step.name.clone());
        match self.behaviors.get(&step.name).cloned().unwrap_or(Behavior::Exit(0)) {
            Behavior::Exit(code) => Ok(RunState {
                exited: true,
                exit_code: code,
                oom_killed: false,
            }),
            Behavior::OomKill => Ok(RunState {
                exited: true,
                exit_code: 137,
                oom_killed: true,
            }),
            Behavior::Write(payload, code) => {
                output.write(payload);
                Ok(RunState {
                    exited: true,
                    exit_code: code,
                    oom_killed: false,
                })
            }
            Behavior::Hang => {
                cancel.cancelled().await;
                Err(EngineError::Canceled)
            }
            Behavior::Error(msg) => Err(EngineError::Run(msg.to_string())),
        }
    }

    async fn destroy(&self, _spec: &Spec) -> Result<(), EngineError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[derive(Default)]
struct CaptureStream {
    out: Mutex<Vec<u8>>,
    closes: AtomicUsize,
}

impl LogWriter for CaptureStream {
    fn write(&self, p: &[u8]) -> usize {
        self.out.lock().unwrap().extend_from_slice(p);
        p.len()
    }
}

#[async_trait]
impl StepStream for CaptureStream {
    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CaptureStreamer {
    streams: Mutex<HashMap<String, Arc<CaptureStream>>>,
}

impl CaptureStreamer {
    fn output(&self, name: &str) -> String {
        let streams = self.streams.lock().unwrap();
        streams
            .get(name)
            .map(|s| String::from_utf8_lossy(&s.out.lock().unwrap()).into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Streamer for CaptureStreamer {
    async fn stream(&self, _number: i64, name: &str) -> Arc<dyn StepStream> {
        let stream = Arc::new(CaptureStream::default());
        self.streams
            .lock()
            .unwrap()
            .insert(name.to_string(), stream.clone());
        stream
    }
}

fn spec_step(name: &str, deps: &[&str]) -> Step {
    Step {
        name: name.to_string(),
        image: "alpine".to_string(),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn make_state(spec: &Spec) -> Arc<State> {
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
    Arc::new(State::new(
        Build::default(),
        Repo::default(),
        Stage {
            steps,
            ..Default::default()
        },
        System::default(),
    ))
}

fn execer(engine: Arc<MockEngine>, streamer: Arc<CaptureStreamer>) -> Execer {
    Execer::new(engine, Arc::new(NopReporter), streamer, 0)
}

#[tokio::test]
async fn test_serial_happy_path() {
    let spec = Arc::new(Spec {
        steps: vec![
            spec_step("clone", &[]),
            spec_step("a", &["clone"]),
            spec_step("b", &["a"]),
            spec_step("c", &["b"]),
        ],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::new());
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer)
        .exec(spec, state.clone(), CancelToken::new())
        .await
        .unwrap();

    assert_eq!(engine.runs(), vec!["clone", "a", "b", "c"]);
    assert_eq!(engine.setup_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.destroy_calls.load(Ordering::SeqCst), 1);
    let stage = state.stage();
    assert_eq!(stage.status, status::PASSING);
    for step in &stage.steps {
        assert_eq!(step.status, status::PASSING, "step {}", step.name);
    }
}

#[tokio::test]
async fn test_fail_fast_cancels_pending_steps() {
    let spec = Arc::new(Spec {
        steps: vec![
            spec_step("a", &[]),
            {
                let mut b = spec_step("b", &[]);
                b.err_policy = ErrPolicy::FailFast;
                b
            },
            spec_step("c", &["a", "b"]),
        ],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::from([("b".to_string(), Behavior::Exit(1))]));
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer)
        .exec(spec, state.clone(), CancelToken::new())
        .await
        .unwrap();

    let stage = state.stage();
    assert_eq!(stage.status, status::FAILING);
    let b = stage.steps.iter().find(|s| s.name == "b").unwrap();
    assert_eq!(b.status, status::FAILING);
    let c = stage.steps.iter().find(|s| s.name == "c").unwrap();
    assert_eq!(c.status, status::SKIPPED);
    assert!(!engine.runs().contains(&"c".to_string()));
    assert_eq!(engine.destroy_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_on_failure_step_skipped_when_passing() {
    let spec = Arc::new(Spec {
        steps: vec![spec_step("a", &[]), {
            let mut b = spec_step("b", &["a"]);
            b.run_policy = RunPolicy::OnFailure;
            b
        }],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::new());
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer)
        .exec(spec, state.clone(), CancelToken::new())
        .await
        .unwrap();

    let stage = state.stage();
    assert_eq!(stage.status, status::PASSING);
    let b = stage.steps.iter().find(|s| s.name == "b").unwrap();
    assert_eq!(b.status, status::SKIPPED);
    assert!(!engine.runs().contains(&"b".to_string()));
}

#[tokio::test]
async fn test_on_failure_step_runs_when_failing() {
    let spec = Arc::new(Spec {
        steps: vec![spec_step("a", &[]), {
            let mut b = spec_step("b", &["a"]);
            b.run_policy = RunPolicy::OnFailure;
            b
        }],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::from([("a".to_string(), Behavior::Exit(1))]));
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer)
        .exec(spec, state.clone(), CancelToken::new())
        .await
        .unwrap();

    let stage = state.stage();
    assert_eq!(stage.status, status::FAILING);
    assert!(engine.runs().contains(&"b".to_string()));
    let b = stage.steps.iter().find(|s| s.name == "b").unwrap();
    assert_eq!(b.status, status::PASSING);
}

#[tokio::test]
async fn test_secret_masking_reaches_stream() {
    let mut step = spec_step("deploy", &[]);
    step.secrets.push(hodei_runner_core::Secret {
        name: "token".to_string(),
        env: "TOKEN".to_string(),
        data: b"s3cr3t-v4lue".to_vec(),
        mask: true,
    });
    let spec = Arc::new(Spec {
        steps: vec![step],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::from([(
        "deploy".to_string(),
        Behavior::Write(b"header: s3cr3t-v4lue\n", 0),
    )]));
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer.clone())
        .exec(spec, state, CancelToken::new())
        .await
        .unwrap();

    assert_eq!(streamer.output("deploy"), "header: ******\n");
}

#[tokio::test]
async fn test_cancellation_mid_run() {
    let spec = Arc::new(Spec {
        steps: vec![
            spec_step("a", &[]),
            spec_step("b", &["a"]),
            spec_step("c", &["b"]),
            spec_step("d", &["c"]),
        ],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::from([("b".to_string(), Behavior::Hang)]));
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);
    let cancel = CancelToken::new();

    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trip.cancel();
    });

    execer(engine.clone(), streamer)
        .exec(spec, state.clone(), cancel)
        .await
        .unwrap();

    let stage = state.stage();
    assert_eq!(stage.status, status::KILLED);
    let b = stage.steps.iter().find(|s| s.name == "b").unwrap();
    assert_eq!(b.status, status::KILLED);
    for name in ["c", "d"] {
        let step = stage.steps.iter().find(|s| s.name == name).unwrap();
        assert_eq!(step.status, status::SKIPPED, "step {name}");
        assert!(!engine.runs().contains(&name.to_string()));
    }
    assert_eq!(engine.destroy_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exit_code_78_skips_remaining() {
    let spec = Arc::new(Spec {
        steps: vec![
            spec_step("a", &[]),
            spec_step("b", &["a"]),
            spec_step("c", &["b"]),
        ],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::from([("a".to_string(), Behavior::Exit(78))]));
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer)
        .exec(spec, state.clone(), CancelToken::new())
        .await
        .unwrap();

    let stage = state.stage();
    assert_eq!(stage.status, status::PASSING);
    assert_eq!(stage.steps[0].status, status::PASSING);
    assert_eq!(stage.steps[1].status, status::SKIPPED);
    assert_eq!(stage.steps[2].status, status::SKIPPED);
    assert_eq!(engine.runs(), vec!["a"]);
}

#[tokio::test]
async fn test_oom_kill_records_137() {
    let spec = Arc::new(Spec {
        steps: vec![spec_step("a", &[])],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::from([("a".to_string(), Behavior::OomKill)]));
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer)
        .exec(spec, state.clone(), CancelToken::new())
        .await
        .unwrap();

    let stage = state.stage();
    assert_eq!(stage.status, status::FAILING);
    assert_eq!(stage.steps[0].exit_code, 137);
}

#[tokio::test]
async fn test_detached_service_failure_does_not_fail_stage() {
    let mut service = spec_step("database", &[]);
    service.detach = true;
    let spec = Arc::new(Spec {
        steps: vec![service, spec_step("test", &["database"])],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::from([(
        "database".to_string(),
        Behavior::Exit(1),
    )]));
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer)
        .exec(spec, state.clone(), CancelToken::new())
        .await
        .unwrap();

    let stage = state.stage();
    assert_eq!(stage.status, status::PASSING);
    let test = stage.steps.iter().find(|s| s.name == "test").unwrap();
    assert_eq!(test.status, status::PASSING);
}

#[tokio::test]
async fn test_ignored_failure_does_not_fail_stage() {
    let spec = Arc::new(Spec {
        steps: vec![
            {
                let mut a = spec_step("a", &[]);
                a.err_policy = ErrPolicy::Ignore;
                a
            },
            spec_step("b", &["a"]),
        ],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::from([("a".to_string(), Behavior::Exit(1))]));
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer)
        .exec(spec, state.clone(), CancelToken::new())
        .await
        .unwrap();

    let stage = state.stage();
    assert_eq!(stage.status, status::PASSING);
    assert_eq!(stage.steps[0].status, status::FAILING);
    assert_eq!(stage.steps[1].status, status::PASSING);
}

#[tokio::test]
async fn test_never_steps_are_not_dispatched() {
    let spec = Arc::new(Spec {
        steps: vec![
            spec_step("a", &[]),
            {
                let mut skipped = spec_step("skipped", &["a"]);
                skipped.run_policy = RunPolicy::Never;
                skipped
            },
        ],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::new());
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer)
        .exec(spec, state, CancelToken::new())
        .await
        .unwrap();

    assert_eq!(engine.runs(), vec!["a"]);
}

#[tokio::test]
async fn test_engine_error_marks_step_errored() {
    let spec = Arc::new(Spec {
        steps: vec![spec_step("a", &[])],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::from([(
        "a".to_string(),
        Behavior::Error("image pull failed"),
    )]));
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    execer(engine.clone(), streamer)
        .exec(spec, state.clone(), CancelToken::new())
        .await
        .unwrap();

    let stage = state.stage();
    assert_eq!(stage.steps[0].status, status::ERROR);
    assert!(state.failed());
}

#[tokio::test]
async fn test_semaphore_bounds_concurrency() {
    let spec = Arc::new(Spec {
        steps: vec![
            spec_step("a", &[]),
            spec_step("b", &[]),
            spec_step("c", &[]),
        ],
        ..Default::default()
    });
    let engine = MockEngine::new(HashMap::new());
    let streamer = Arc::new(CaptureStreamer::default());
    let state = make_state(&spec);

    Execer::new(engine.clone(), Arc::new(NopReporter), streamer, 1)
        .exec(spec, state.clone(), CancelToken::new())
        .await
        .unwrap();

    assert_eq!(engine.runs().len(), 3);
    assert_eq!(state.stage().status, status::PASSING);
}
