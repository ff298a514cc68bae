//! In-memory job registry.
//!
//! Jobs live for the server process's lifetime: ids come from a
//! monotonic counter, state transitions flow through a watch channel
//! (`Starting → Running → Done | Failed`), and output lands in
//! per-job files under the registry's working directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::DetachedResult;
use crate::runner;

/// Interpreter used to run submitted code.
#[derive(Debug, Clone)]
pub struct ExeConfig {
    pub exename: String,
    pub exeflags: Vec<String>,
}

impl Default for ExeConfig {
    fn default() -> Self {
        Self {
            exename: "julia".to_string(),
            exeflags: Vec::new(),
        }
    }
}

/// Lifecycle of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Starting,
    Running,
    Done,
    Failed(String),
}

impl JobState {
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed(_) => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed(_))
    }
}

/// One submitted job and its capture files.
pub struct Job {
    pub id: u64,
    /// The code as executed (wrapper already stripped).
    pub code: String,
    pub code_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    state: watch::Receiver<JobState>,
}

impl Job {
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Block until the job finishes, returning the terminal state.
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state.clone();
        loop {
            let state = rx.borrow().clone();
            if state.is_finished() {
                return state;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

/// Registry of all jobs this server has accepted.
pub struct JobRegistry {
    workdir: PathBuf,
    exe: ExeConfig,
    next_id: AtomicU64,
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    /// Process-wide variable bundle, merged on each submission that
    /// carries one and persisted for the evaluated code to read.
    variables: Mutex<serde_json::Map<String, Value>>,
}

impl JobRegistry {
    pub fn new(workdir: PathBuf, exe: ExeConfig) -> Self {
        Self {
            workdir,
            exe,
            next_id: AtomicU64::new(0),
            jobs: RwLock::new(HashMap::new()),
            variables: Mutex::new(serde_json::Map::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().expect("jobs lock poisoned").get(id).cloned()
    }

    /// Merge a decoded variable bundle into the shared map and write
    /// the whole map next to the job files.
    pub fn merge_variables(&self, bundle: serde_json::Map<String, Value>) -> std::io::Result<()> {
        let mut variables = self.variables.lock().expect("variables lock poisoned");
        for (key, value) in bundle {
            variables.insert(key, value);
        }
        let path = self.workdir.join("variablebundle.json");
        std::fs::write(&path, Value::Object(variables.clone()).to_string())?;
        debug!(?path, "variable bundle updated");
        Ok(())
    }

    /// Accept a job: allocate the next id, strip any `begin…end`
    /// wrapper, write the code file, and start the run task.
    pub async fn submit(&self, code: &str) -> DetachedResult<Arc<Job>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let code = runner::strip_begin_end(code);

        let code_path = self.workdir.join(format!("job-{id}.code"));
        let stdout_path = self.workdir.join(format!("job-{id}.out"));
        let stderr_path = self.workdir.join(format!("job-{id}.err"));
        tokio::fs::write(&code_path, &code).await?;

        let (state_tx, state_rx) = watch::channel(JobState::Starting);
        let job = Arc::new(Job {
            id,
            code: code.clone(),
            code_path: code_path.clone(),
            stdout_path: stdout_path.clone(),
            stderr_path: stderr_path.clone(),
            state: state_rx,
        });

        self.jobs
            .write()
            .expect("jobs lock poisoned")
            .insert(id.to_string(), Arc::clone(&job));

        let exe = self.exe.clone();
        tokio::spawn(async move {
            let _ = state_tx.send(JobState::Running);
            match runner::execute(&exe, &code, &code_path, &stdout_path, &stderr_path).await {
                Ok(()) => {
                    debug!(job = id, "job finished");
                    let _ = state_tx.send(JobState::Done);
                }
                Err(message) => {
                    warn!(job = id, %message, "job failed");
                    let _ = state_tx.send(JobState::Failed(message));
                }
            }
        });

        Ok(job)
    }
}
