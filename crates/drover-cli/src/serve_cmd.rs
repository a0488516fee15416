use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use drover_core::agent::health::HealthChecker;
use drover_core::agent::http::{HttpAgent, HttpAgentConfig};
use drover_core::agent::registry::AgentRegistry;
use drover_core::agent::router::AgentRouter;
use drover_core::engine::{Engine, EngineConfig};
use drover_core::planner::HttpPlanner;
use drover_core::retry::StepBackoff;
use drover_core::runner::StepRunner;
use drover_core::scheduler::{Scheduler, SchedulerConfig};
use drover_core::store::postgres::{PgStepStore, PgTaskStore};
use drover_core::store::{StepStore, TaskStore};
use drover_core::sweeper::LockSweeper;
use drover_db::models::{Step, Task};

use crate::config::DroverConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<drover_core::store::StoreError> for AppError {
    fn from(err: drover_core::store::StoreError) -> Self {
        Self::internal(err.into())
    }
}

// ---------------------------------------------------------------------------
// State and wire types
// ---------------------------------------------------------------------------

/// Everything the handlers need, assembled once at startup.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub tasks: Arc<dyn TaskStore>,
    pub steps: Arc<dyn StepStore>,
    pub health: Arc<HealthChecker>,
    /// Parent token; each task loop runs under a child of it.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub goal: String,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    pub task: Task,
    pub steps: Vec<Step>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/agents/health", get(agents_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Assemble stores, agents, and background loops from the resolved config,
/// then serve the HTTP surface until ctrl-c.
pub async fn run_serve(
    config: DroverConfig,
    bind: &str,
    port: u16,
    max_parallel: Option<usize>,
) -> Result<()> {
    let pool = drover_db::pool::create_pool(&config.db_config).await?;

    let tasks: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool.clone()));
    let steps: Arc<dyn StepStore> = Arc::new(PgStepStore::new(pool.clone()));

    let registry = Arc::new(AgentRegistry::new());
    for agent in &config.agents {
        let mut agent_config = HttpAgentConfig::new(&agent.name, &agent.url);
        if let Some(secs) = agent.timeout_secs {
            agent_config.timeout = Duration::from_secs(secs);
        }
        registry.register(Arc::new(HttpAgent::new(agent_config)));
        tracing::info!(agent = %agent.name, url = %agent.url, "registered agent");
    }
    if registry.is_empty() {
        tracing::warn!("no agents configured; every step dispatch will fail");
    }

    let runner = Arc::new(StepRunner::new(
        Arc::clone(&steps),
        Arc::new(AgentRouter::new(Arc::clone(&registry))),
        Arc::new(StepBackoff),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&tasks),
        Arc::clone(&steps),
        runner,
        SchedulerConfig {
            max_parallel: max_parallel.unwrap_or(config.engine.max_parallel),
            ..SchedulerConfig::default()
        },
    ));
    let engine = Arc::new(Engine::new(
        Arc::new(HttpPlanner::new(&config.planner_url)),
        Arc::clone(&tasks),
        Arc::clone(&steps),
        Arc::clone(&scheduler),
        EngineConfig {
            max_attempts: config.engine.max_attempts,
            step_timeout_secs: config.engine.step_timeout_secs,
            ..EngineConfig::default()
        },
    ));
    let health = Arc::new(HealthChecker::new(
        Arc::clone(&registry),
        config.health_interval(),
    ));

    let shutdown = CancellationToken::new();
    let scheduler_handle = scheduler.spawn(shutdown.clone());
    let health_handle = health.spawn(shutdown.clone());
    let sweeper_handle = LockSweeper::new(
        Arc::clone(&steps),
        config.lock_ttl(),
        config.lock_ttl() / 2,
    )
    .spawn(shutdown.clone());

    let state = Arc::new(AppState {
        engine,
        tasks,
        steps,
        health,
        shutdown: shutdown.clone(),
    });

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("drover serving on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Wind down the background loops before dropping the pool.
    shutdown.cancel();
    let _ = scheduler_handle.await;
    let _ = health_handle.await;
    let _ = sweeper_handle.await;
    pool.close().await;
    tracing::info!("drover shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> &'static str {
    "ok"
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<Task>, AppError> {
    if request.goal.trim().is_empty() {
        return Err(AppError::bad_request("goal must not be empty"));
    }

    let task = state.tasks.create(&request.goal).await?;

    // Materialize the plan synchronously so the caller learns about
    // planner failures; the task loop itself runs in the background.
    if let Err(err) = state.engine.init_task_execution(&task).await {
        let _ = state
            .tasks
            .update_status(task.id, drover_db::models::TaskStatus::Failed)
            .await;
        return Err(AppError::internal(err));
    }

    let engine = Arc::clone(&state.engine);
    let task_id = task.id;
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        if let Err(err) = engine.run_task_loop(task_id, cancel).await {
            tracing::error!(task_id = %task_id, error = %err, "task loop failed");
        }
    });

    Ok(Json(task))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskDetailResponse>, AppError> {
    let task = state
        .tasks
        .get_by_id(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    let steps = state.steps.get_by_task(id).await?;

    Ok(Json(TaskDetailResponse { task, steps }))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .tasks
        .get_by_id(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    state
        .engine
        .cancel_task(id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(serde_json::json!({ "status": "cancelled" })))
}

async fn agents_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "agents": state.health.all_statuses() }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use drover_core::agent::{Agent, AgentError, Callable};
    use drover_core::planner::{PlanRequest, PlanResponse, PlannedStep, Planner};
    use drover_core::store::memory::{MemStepStore, MemTaskStore};

    struct EchoAgent;

    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            "echo"
        }

        fn as_callable(&self) -> Option<&dyn Callable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Callable for EchoAgent {
        async fn call(&self, input: &Value) -> Result<Value, AgentError> {
            Ok(json!({ "echoed": input }))
        }
    }

    struct SlowAgent;

    impl Agent for SlowAgent {
        fn name(&self) -> &str {
            "slow"
        }

        fn as_callable(&self) -> Option<&dyn Callable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Callable for SlowAgent {
        async fn call(&self, input: &Value) -> Result<Value, AgentError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({ "echoed": input }))
        }
    }

    /// Plans one step against the named agent.
    struct SingleStepPlanner {
        agent: &'static str,
    }

    impl SingleStepPlanner {
        fn echo() -> Self {
            Self { agent: "echo" }
        }

        fn slow() -> Self {
            Self { agent: "slow" }
        }
    }

    #[async_trait]
    impl Planner for SingleStepPlanner {
        async fn plan(&self, _request: &PlanRequest) -> anyhow::Result<PlanResponse> {
            Ok(PlanResponse {
                steps: vec![PlannedStep {
                    id: Uuid::new_v4(),
                    agent: self.agent.to_owned(),
                    input: json!({"text": "hi"}),
                    depends_on: vec![],
                }],
            })
        }
    }

    struct BrokenPlanner;

    #[async_trait]
    impl Planner for BrokenPlanner {
        async fn plan(&self, _request: &PlanRequest) -> anyhow::Result<PlanResponse> {
            anyhow::bail!("planner exploded")
        }
    }

    fn test_state(planner: Arc<dyn Planner>) -> Arc<AppState> {
        let tasks: Arc<dyn TaskStore> = Arc::new(MemTaskStore::new());
        let steps: Arc<dyn StepStore> = Arc::new(MemStepStore::new());

        let registry = Arc::new(AgentRegistry::new());
        registry.register(Arc::new(EchoAgent));
        registry.register(Arc::new(SlowAgent));

        let runner = Arc::new(StepRunner::new(
            Arc::clone(&steps),
            Arc::new(AgentRouter::new(Arc::clone(&registry))),
            Arc::new(StepBackoff),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&tasks),
            Arc::clone(&steps),
            runner,
            SchedulerConfig {
                max_parallel: 2,
                tick_interval: Duration::from_millis(50),
                worker_id: "test-worker".to_owned(),
            },
        ));
        let engine = Arc::new(Engine::new(
            planner,
            Arc::clone(&tasks),
            Arc::clone(&steps),
            scheduler,
            EngineConfig::default(),
        ));
        let health = Arc::new(HealthChecker::new(registry, Duration::from_secs(60)));

        Arc::new(AppState {
            engine,
            tasks,
            steps,
            health,
            shutdown: CancellationToken::new(),
        })
    }

    async fn send(
        state: Arc<AppState>,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        let app = build_router(state);
        let request = match body {
            Some(json) => Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };
        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let state = test_state(Arc::new(SingleStepPlanner::echo()));
        let resp = send(state, "GET", "/health", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn create_task_runs_to_completion() {
        let state = test_state(Arc::new(SingleStepPlanner::echo()));

        let resp = send(
            Arc::clone(&state),
            "POST",
            "/tasks",
            Some(json!({"goal": "say hello"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let task = body_json(resp).await;
        assert_eq!(task["goal"], "say hello");
        let task_id = task["id"].as_str().unwrap().to_owned();

        // The background loop drives the task to completed.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let resp = send(Arc::clone(&state), "GET", &format!("/tasks/{task_id}"), None).await;
            assert_eq!(resp.status(), StatusCode::OK);
            let detail = body_json(resp).await;
            if detail["task"]["status"] == "completed" {
                assert_eq!(detail["steps"][0]["status"], "done");
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task did not complete in time: {detail}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn create_task_with_empty_goal_is_rejected() {
        let state = test_state(Arc::new(SingleStepPlanner::echo()));
        let resp = send(state, "POST", "/tasks", Some(json!({"goal": "  "}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_task_surfaces_planner_failure() {
        let state = test_state(Arc::new(BrokenPlanner));
        let resp = send(
            Arc::clone(&state),
            "POST",
            "/tasks",
            Some(json!({"goal": "doomed"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn get_unknown_task_is_404() {
        let state = test_state(Arc::new(SingleStepPlanner::echo()));
        let resp = send(
            state,
            "GET",
            &format!("/tasks/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_task_reports_cancelled() {
        // The slow agent keeps the step in flight so the cancel lands first.
        let state = test_state(Arc::new(SingleStepPlanner::slow()));

        let resp = send(
            Arc::clone(&state),
            "POST",
            "/tasks",
            Some(json!({"goal": "cancel me"})),
        )
        .await;
        let task = body_json(resp).await;
        let task_id = task["id"].as_str().unwrap().to_owned();

        let resp = send(
            Arc::clone(&state),
            "POST",
            &format!("/tasks/{task_id}/cancel"),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "cancelled");

        let resp = send(Arc::clone(&state), "GET", &format!("/tasks/{task_id}"), None).await;
        let detail = body_json(resp).await;
        assert_eq!(detail["task"]["status"], "canceled");
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_404() {
        let state = test_state(Arc::new(SingleStepPlanner::echo()));
        let resp = send(
            state,
            "POST",
            &format!("/tasks/{}/cancel", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn agents_health_lists_probed_agents() {
        let state = test_state(Arc::new(SingleStepPlanner::echo()));
        state.health.check_all().await;

        let resp = send(state, "GET", "/agents/health", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let agents = body["agents"].as_array().unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0]["name"], "echo");
        assert_eq!(agents[0]["healthy"], true);
        assert_eq!(agents[1]["name"], "slow");
    }
}
