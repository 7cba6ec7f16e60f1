//! Shared test helpers for scheduler-level integration tests.
//!
//! Provides a scripted in-memory executor, a zero-cooldown configuration,
//! and store seeding so individual test modules can focus on behaviour.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use storyloop::config::EngineConfig;
use storyloop::engine::scheduler::Scheduler;
use storyloop::executor::{ExecutionRequest, Executor, ExecutorOutput};
use storyloop::models::job::Job;
use storyloop::store::JobStore;
use storyloop::Result;
use tokio_util::sync::CancellationToken;

type Responder = dyn Fn(&ExecutionRequest, usize) -> ExecutorOutput + Send + Sync;

/// Executor returning scripted output and recording every request.
pub struct ScriptedExecutor {
    responder: Box<Responder>,
    calls: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedExecutor {
    /// Reply with `outputs` in order; the last one repeats.
    pub fn sequence(outputs: Vec<ExecutorOutput>) -> Arc<Self> {
        assert!(!outputs.is_empty(), "script needs at least one output");
        Self::from_fn(move |_, n| outputs[n.min(outputs.len() - 1)].clone())
    }

    /// Always reply with `output`.
    pub fn always(output: ExecutorOutput) -> Arc<Self> {
        Self::sequence(vec![output])
    }

    /// Reply with `f(request, call_index)`.
    pub fn from_fn(
        f: impl Fn(&ExecutionRequest, usize) -> ExecutorOutput + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(f),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Requests received so far.
    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of dispatches.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Job ids in dispatch order.
    pub fn job_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|r| r.job_id).collect()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorOutput>> + Send + '_>> {
        let output = {
            let mut calls = self.calls.lock().unwrap();
            let output = (self.responder)(&request, calls.len());
            calls.push(request);
            output
        };
        Box::pin(async move { Ok(output) })
    }
}

/// Executor whose runs never finish.
pub struct HangingExecutor;

impl Executor for HangingExecutor {
    fn execute(
        &self,
        _request: ExecutionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorOutput>> + Send + '_>> {
        Box::pin(std::future::pending())
    }
}

/// Configuration rooted at `workspace` with zero cooldowns.
pub fn test_config(workspace: &Path) -> EngineConfig {
    let toml = format!(
        r#"
workspace_root = '{root}'
max_iterations = 20
ipc_name = "storyloop-test"

[executor]
command = "true"

[retry]
max_retries = 5
cooldown_seconds = 0
no_response_max_retries = 3
no_response_cooldown_seconds = 0
"#,
        root = workspace.display(),
    );
    EngineConfig::from_toml_str(&toml).expect("valid test config")
}

/// Store under the config's state directory holding `jobs`.
pub fn seed_store(config: &EngineConfig, jobs: Vec<Job>) -> JobStore {
    let mut store = JobStore::init(config.state_path()).expect("store init");
    for job in jobs {
        store.append_job(job).expect("append job");
    }
    store
}

/// Scheduler over `store` driven by `executor`.
pub fn scheduler(
    config: EngineConfig,
    store: JobStore,
    executor: Arc<dyn Executor>,
    cancel: CancellationToken,
) -> Scheduler {
    Scheduler::new(Arc::new(config), store, executor, cancel).expect("scheduler")
}

/// Successful run printing `stdout`.
pub fn ok(stdout: &str) -> ExecutorOutput {
    ExecutorOutput::new(stdout, 0)
}
