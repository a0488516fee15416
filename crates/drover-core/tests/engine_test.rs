//! End-to-end engine scenarios on the in-memory stores: plans go in, the
//! task loop drives the DAG, and terminal state comes out.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_core::agent::registry::AgentRegistry;
use drover_core::agent::router::AgentRouter;
use drover_core::agent::{Agent, AgentError, Callable};
use drover_core::engine::{Engine, EngineConfig};
use drover_core::planner::{PlanRequest, PlanResponse, PlannedStep, Planner};
use drover_core::retry::StepBackoff;
use drover_core::runner::StepRunner;
use drover_core::scheduler::{Scheduler, SchedulerConfig};
use drover_core::store::memory::{MemStepStore, MemTaskStore};
use drover_core::store::{StepStore, TaskStore};
use drover_db::models::{StepStatus, Task, TaskStatus};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Planner that returns a canned plan.
struct FixedPlanner {
    steps: Vec<PlannedStep>,
}

#[async_trait]
impl Planner for FixedPlanner {
    async fn plan(&self, _request: &PlanRequest) -> anyhow::Result<PlanResponse> {
        Ok(PlanResponse {
            steps: self.steps.clone(),
        })
    }
}

/// One recorded agent invocation.
#[derive(Debug, Clone)]
struct CallRecord {
    input: Value,
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
}

/// Agent that fails its first `fail_first` calls with a transport error,
/// optionally sleeps, and records every invocation.
struct ScriptedAgent {
    agent_name: String,
    fail_first: u32,
    delay: Duration,
    calls: AtomicU32,
    records: Mutex<Vec<CallRecord>>,
}

impl ScriptedAgent {
    fn new(name: &str) -> Self {
        Self {
            agent_name: name.to_owned(),
            fail_first: 0,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            records: Mutex::new(Vec::new()),
        }
    }

    fn failing_first(name: &str, fail_first: u32) -> Self {
        Self {
            fail_first,
            ..Self::new(name)
        }
    }

    fn slow(name: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(name)
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn records(&self) -> Vec<CallRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.agent_name
    }

    fn as_callable(&self) -> Option<&dyn Callable> {
        Some(self)
    }
}

#[async_trait]
impl Callable for ScriptedAgent {
    async fn call(&self, input: &Value) -> Result<Value, AgentError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Utc::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.records.lock().unwrap().push(CallRecord {
            input: input.clone(),
            started,
            finished: Utc::now(),
        });
        if n < self.fail_first {
            Err(AgentError::Transport("connection reset".to_owned()))
        } else {
            Ok(serde_json::json!({"result": "ok"}))
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    tasks: Arc<MemTaskStore>,
    steps: Arc<MemStepStore>,
    engine: Engine,
}

fn build_harness(
    planned: Vec<PlannedStep>,
    agents: Vec<Arc<dyn Agent>>,
    max_parallel: usize,
    engine_config: EngineConfig,
) -> Harness {
    let tasks = Arc::new(MemTaskStore::new());
    let steps = Arc::new(MemStepStore::new());

    let registry = Arc::new(AgentRegistry::new());
    for agent in agents {
        registry.register(agent);
    }

    let runner = Arc::new(StepRunner::new(
        Arc::clone(&steps) as Arc<dyn StepStore>,
        Arc::new(AgentRouter::new(registry)),
        Arc::new(StepBackoff),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&tasks) as Arc<dyn TaskStore>,
        Arc::clone(&steps) as Arc<dyn StepStore>,
        runner,
        SchedulerConfig {
            max_parallel,
            tick_interval: Duration::from_millis(50),
            worker_id: "test-worker".to_owned(),
        },
    ));
    let engine = Engine::new(
        Arc::new(FixedPlanner { steps: planned }),
        Arc::clone(&tasks) as Arc<dyn TaskStore>,
        Arc::clone(&steps) as Arc<dyn StepStore>,
        scheduler,
        engine_config,
    );

    Harness {
        tasks,
        steps,
        engine,
    }
}

fn planned_step(agent: &str, input: Value, deps: Vec<Uuid>) -> PlannedStep {
    PlannedStep {
        id: Uuid::new_v4(),
        agent: agent.to_owned(),
        input,
        depends_on: deps,
    }
}

async fn create_and_run(harness: &Harness) -> Task {
    let task = harness.tasks.create("test goal").await.unwrap();
    harness.engine.init_task_execution(&task).await.unwrap();
    harness
        .engine
        .run_task_loop(task.id, CancellationToken::new())
        .await
        .unwrap();
    harness.tasks.get_by_id(task.id).await.unwrap().unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_step_happy_path() {
    let echo = Arc::new(ScriptedAgent::new("echo"));
    let plan = vec![planned_step("echo", serde_json::json!({"text": "hi"}), vec![])];
    let harness = build_harness(plan, vec![Arc::clone(&echo) as Arc<dyn Agent>], 2, EngineConfig::default());

    let task = create_and_run(&harness).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let steps = harness.steps.get_by_task(task.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Done);
    assert_eq!(steps[0].output, Some(serde_json::json!({"result": "ok"})));
    assert_eq!(echo.call_count(), 1);
}

#[tokio::test]
async fn linear_chain_runs_in_dependency_order() {
    let echo = Arc::new(ScriptedAgent::new("echo"));
    let a = planned_step("echo", serde_json::json!({"step": "a"}), vec![]);
    let b = planned_step("echo", serde_json::json!({"step": "b"}), vec![a.id]);
    let c = planned_step("echo", serde_json::json!({"step": "c"}), vec![b.id]);
    let harness = build_harness(
        vec![a, b, c],
        vec![Arc::clone(&echo) as Arc<dyn Agent>],
        2,
        EngineConfig::default(),
    );

    let task = create_and_run(&harness).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let steps = harness.steps.get_by_task(task.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Done));

    let order: Vec<String> = echo
        .records()
        .iter()
        .map(|r| r.input["step"].as_str().unwrap_or("").to_owned())
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn diamond_runs_middle_steps_concurrently() {
    let fan = Arc::new(ScriptedAgent::slow("fan", Duration::from_millis(200)));
    let a = planned_step("fan", serde_json::json!({"step": "a"}), vec![]);
    let b = planned_step("fan", serde_json::json!({"step": "b"}), vec![a.id]);
    let c = planned_step("fan", serde_json::json!({"step": "c"}), vec![a.id]);
    let d = planned_step("fan", serde_json::json!({"step": "d"}), vec![b.id, c.id]);
    let harness = build_harness(
        vec![a, b, c, d],
        vec![Arc::clone(&fan) as Arc<dyn Agent>],
        2,
        EngineConfig::default(),
    );

    let task = create_and_run(&harness).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let steps = harness.steps.get_by_task(task.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Done));

    let records = fan.records();
    assert_eq!(records.len(), 4);
    let rec = |name: &str| {
        records
            .iter()
            .find(|r| r.input["step"] == name)
            .unwrap_or_else(|| panic!("no record for step {name}"))
            .clone()
    };
    let (b, c, d) = (rec("b"), rec("c"), rec("d"));

    // B and C overlap in time; D starts only after both have finished.
    assert!(b.started < c.finished && c.started < b.finished, "b and c must run concurrently");
    assert!(d.started >= b.finished && d.started >= c.finished, "d must start after b and c");
}

#[tokio::test]
async fn retry_then_success_respects_backoff() {
    let flaky = Arc::new(ScriptedAgent::failing_first("flaky", 2));
    let plan = vec![planned_step("flaky", serde_json::json!({}), vec![])];
    let harness = build_harness(
        plan,
        vec![Arc::clone(&flaky) as Arc<dyn Agent>],
        2,
        EngineConfig::default(),
    );

    let started = Utc::now();
    let task = create_and_run(&harness).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let steps = harness.steps.get_by_task(task.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Done);
    assert_eq!(steps[0].attempt, 3);
    assert_eq!(flaky.call_count(), 3);

    // Two failures with backoff 1 s then 3 s: the third call lands no
    // earlier than 4 s after the first.
    let records = flaky.records();
    let gap_one = records[1].started.signed_duration_since(records[0].finished);
    let gap_two = records[2].started.signed_duration_since(records[1].finished);
    assert!(
        (900..=1400).contains(&gap_one.num_milliseconds()),
        "first retry gap: {} ms",
        gap_one.num_milliseconds()
    );
    assert!(
        (2900..=3400).contains(&gap_two.num_milliseconds()),
        "second retry gap: {} ms",
        gap_two.num_milliseconds()
    );
    assert!(Utc::now().signed_duration_since(started).num_milliseconds() >= 4000);
}

#[tokio::test]
async fn exhausted_retries_fail_the_task() {
    let broken = Arc::new(ScriptedAgent::failing_first("broken", u32::MAX));
    let plan = vec![planned_step("broken", serde_json::json!({}), vec![])];
    let harness = build_harness(
        plan,
        vec![Arc::clone(&broken) as Arc<dyn Agent>],
        2,
        EngineConfig {
            max_attempts: 2,
            ..EngineConfig::default()
        },
    );

    let task = create_and_run(&harness).await;

    assert_eq!(task.status, TaskStatus::Failed);
    let steps = harness.steps.get_by_task(task.id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Error);
    assert_eq!(steps[0].attempt, 2);
    // No third call is ever made.
    assert_eq!(broken.call_count(), 2);
}

#[tokio::test]
async fn cancel_mid_flight_cancels_everything() {
    let slow = Arc::new(ScriptedAgent::slow("slow", Duration::from_secs(3)));
    let a = planned_step("slow", serde_json::json!({"step": "a"}), vec![]);
    let b = planned_step("slow", serde_json::json!({"step": "b"}), vec![a.id]);
    let harness = Arc::new(build_harness(
        vec![a, b],
        vec![Arc::clone(&slow) as Arc<dyn Agent>],
        2,
        EngineConfig::default(),
    ));

    let task = harness.tasks.create("cancel me").await.unwrap();
    harness.engine.init_task_execution(&task).await.unwrap();

    let loop_harness = Arc::clone(&harness);
    let task_id = task.id;
    let loop_handle = tokio::spawn(async move {
        loop_harness
            .engine
            .run_task_loop(task_id, CancellationToken::new())
            .await
    });

    // Let step A get claimed and block inside the agent call.
    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.engine.cancel_task(task.id).await.unwrap();

    let steps = harness.steps.get_by_task(task.id).await.unwrap();
    assert!(
        steps.iter().all(|s| s.status == StepStatus::Canceled),
        "all steps canceled after cancel_task"
    );
    let b_step = steps.iter().find(|s| s.input["step"] == "b").unwrap();
    assert!(b_step.started_at.is_none(), "b was never claimed");
    assert_eq!(b_step.attempt, 0);

    let task = harness.tasks.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);

    // The loop drains the in-flight call and exits; the late write-back
    // must not resurrect the canceled step.
    let result = tokio::time::timeout(Duration::from_secs(10), loop_handle)
        .await
        .expect("task loop exits after cancel")
        .expect("task loop joins");
    result.expect("task loop returns cleanly");

    let steps = harness.steps.get_by_task(task.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Canceled));
    let task = harness.tasks.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
}

#[tokio::test]
async fn invalid_plan_fails_task_creation() {
    let echo = Arc::new(ScriptedAgent::new("echo"));
    let id = Uuid::new_v4();
    let plan = vec![
        PlannedStep {
            id,
            agent: "echo".to_owned(),
            input: serde_json::json!({}),
            depends_on: vec![id],
        },
    ];
    let harness = build_harness(
        plan,
        vec![Arc::clone(&echo) as Arc<dyn Agent>],
        2,
        EngineConfig::default(),
    );

    let task = harness.tasks.create("bad plan").await.unwrap();
    let result = harness.engine.init_task_execution(&task).await;
    assert!(result.is_err());

    // Nothing was materialized.
    let steps = harness.steps.get_by_task(task.id).await.unwrap();
    assert!(steps.is_empty());
    assert_eq!(echo.call_count(), 0);
}

#[tokio::test]
async fn background_scheduler_drives_task_to_completion() {
    // The global tick loop (not the per-task pulse) picks up active tasks.
    let echo = Arc::new(ScriptedAgent::new("echo"));
    let a = planned_step("echo", serde_json::json!({"step": "a"}), vec![]);
    let b = planned_step("echo", serde_json::json!({"step": "b"}), vec![a.id]);

    let tasks = Arc::new(MemTaskStore::new());
    let steps = Arc::new(MemStepStore::new());
    let registry = Arc::new(AgentRegistry::new());
    registry.register(Arc::clone(&echo) as Arc<dyn Agent>);

    let runner = Arc::new(StepRunner::new(
        Arc::clone(&steps) as Arc<dyn StepStore>,
        Arc::new(AgentRouter::new(registry)),
        Arc::new(StepBackoff),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&tasks) as Arc<dyn TaskStore>,
        Arc::clone(&steps) as Arc<dyn StepStore>,
        runner,
        SchedulerConfig {
            max_parallel: 2,
            tick_interval: Duration::from_millis(20),
            worker_id: "bg-worker".to_owned(),
        },
    ));
    let engine = Engine::new(
        Arc::new(FixedPlanner {
            steps: vec![a, b],
        }),
        Arc::clone(&tasks) as Arc<dyn TaskStore>,
        Arc::clone(&steps) as Arc<dyn StepStore>,
        Arc::clone(&scheduler),
        EngineConfig::default(),
    );

    let cancel = CancellationToken::new();
    let scheduler_handle = scheduler.spawn(cancel.clone());

    let task = tasks.create("background goal").await.unwrap();
    engine.init_task_execution(&task).await.unwrap();
    tasks
        .update_status(task.id, TaskStatus::Running)
        .await
        .unwrap();

    // Wait for the tick loop to claim and run both steps.
    let deadline = Utc::now() + chrono::Duration::seconds(5);
    loop {
        let all = steps.get_by_task(task.id).await.unwrap();
        if all.iter().all(|s| s.status == StepStatus::Done) {
            break;
        }
        assert!(Utc::now() < deadline, "steps not done in time: {all:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(echo.call_count(), 2);
    cancel.cancel();
    scheduler_handle.await.unwrap();
}
