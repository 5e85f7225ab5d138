//! Shared helpers for queue integration tests.
//!
//! Provides a throwaway on-disk database, fast engine timings and a scripted
//! command runner so worker behaviour can be tested without real processes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use queuectl::config::EngineConfig;
use queuectl::store::Store;
use queuectl::worker::{CommandRunner, ExecutionResult};
use queuectl::{JobEngine, QueueError, Result};

/// Engine config with short intervals for faster tests
pub fn test_engine_config(db_path: PathBuf) -> EngineConfig {
    EngineConfig::new(db_path)
        .with_poll_interval(Duration::from_millis(10))
        .with_backoff_unit(Duration::from_millis(1))
        .with_heartbeat_interval(Duration::from_millis(10))
}

/// A temporary database directory. The files go away when this is dropped.
pub struct TestDb {
    dir: TempDir,
}

impl TestDb {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("queue.db")
    }

    pub fn config(&self) -> EngineConfig {
        test_engine_config(self.path())
    }

    /// A fresh connection to the shared database file.
    pub fn store(&self) -> Arc<Store> {
        Arc::new(Store::open(self.path()).unwrap())
    }

    pub fn engine(&self, runner: ScriptedRunner) -> JobEngine<ScriptedRunner> {
        JobEngine::with_runner(self.config(), runner).unwrap()
    }
}

/// What a [`ScriptedRunner`] does when it sees a command.
#[derive(Debug, Clone)]
pub enum Script {
    Exit(i32),
    /// Sleep, then exit 0
    Sleep(Duration),
    /// Sleep, then exit with the given code
    SlowExit(Duration, i32),
    /// Exit with each code in turn, repeating the last one
    Sequence(Vec<i32>),
    /// The command cannot be started at all
    SpawnError,
}

#[derive(Default)]
struct RunnerState {
    scripts: HashMap<String, Script>,
    calls: Vec<String>,
    counts: HashMap<String, usize>,
}

/// Command runner driven by a table of scripted results.
///
/// Unknown commands succeed. Every call is recorded in order.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, command: &str, script: Script) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(command.to_string(), script);
        self
    }

    /// Commands run so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .counts
            .get(command)
            .copied()
            .unwrap_or(0)
    }
}

impl CommandRunner for ScriptedRunner {
    async fn execute(&self, command: &str) -> Result<ExecutionResult> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(command.to_string());
            let count = state.counts.entry(command.to_string()).or_insert(0);
            let call_index = *count;
            *count += 1;
            match state.scripts.get(command) {
                Some(Script::Sequence(codes)) => {
                    let code = codes
                        .get(call_index)
                        .or(codes.last())
                        .copied()
                        .unwrap_or(0);
                    Script::Exit(code)
                }
                Some(script) => script.clone(),
                None => Script::Exit(0),
            }
        };

        match script {
            Script::Exit(code) => Ok(ExecutionResult::from_exit_code(code)),
            Script::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(ExecutionResult::from_exit_code(0))
            }
            Script::SlowExit(duration, code) => {
                tokio::time::sleep(duration).await;
                Ok(ExecutionResult::from_exit_code(code))
            }
            Script::SpawnError => Err(QueueError::ExecutionFailure(format!(
                "failed to spawn {command}"
            ))),
            Script::Sequence(_) => unreachable!("sequence resolved above"),
        }
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}
