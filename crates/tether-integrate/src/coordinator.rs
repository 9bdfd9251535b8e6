//! The serving side: registers workers, divides a job and sums the results.
//!
//! A job over `[lower, upper]` becomes one task per core across all
//! registered workers. Each worker receives a share proportional to its core
//! count, and every task is a separate engine call so one failure loses only
//! that task's contribution.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{ConnectionId, RegistryError};
use tether_net::{HandlerError, PendingCall, Server, handler_fn};
use tracing::{info, warn};

use crate::integrate::split;
use crate::protocol::{
    self, HELLO, Hello, INTEGRATE, IntegrationResult, IntegrationTask, Welcome,
};

const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A registered worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    /// The worker's connection.
    pub id: ConnectionId,
    /// Cores it reported (or the coordinator's default).
    pub cores: usize,
}

/// Tasks bound for one worker.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    /// Target worker.
    pub worker: ConnectionId,
    /// Its share of the job.
    pub tasks: Vec<IntegrationTask>,
}

/// A task that produced no result.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskFailure {
    /// The task.
    pub task_id: u64,
    /// The worker it was sent to.
    pub worker: ConnectionId,
    /// What went wrong.
    pub error: String,
}

/// Outcome of one job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntegrationReport {
    /// Sum of every successful task.
    pub value: f64,
    /// Tasks issued.
    pub tasks: usize,
    /// Tasks that failed.
    pub failed: Vec<TaskFailure>,
}

impl IntegrationReport {
    /// Whether every task contributed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cut `[lower, upper]` into `total_cores` tasks numbered from zero.
///
/// Invalid input (`upper <= lower`, a non-positive step, no cores) yields no
/// tasks.
pub fn divide(lower: f64, upper: f64, step: f64, total_cores: usize) -> Vec<IntegrationTask> {
    if upper <= lower || step <= 0.0 || total_cores == 0 {
        return Vec::new();
    }
    split(lower, upper, total_cores)
        .into_iter()
        .zip(0u64..)
        .map(|((lower, upper), task_id)| IntegrationTask {
            task_id,
            lower,
            upper,
            step,
        })
        .collect()
}

/// Hand each worker `ceil(cores * tasks / total_cores)` tasks, in order,
/// until the tasks run out.
pub fn assign(workers: &[WorkerInfo], tasks: Vec<IntegrationTask>) -> Vec<Assignment> {
    let total_cores: usize = workers.iter().map(|w| w.cores).sum();
    if total_cores == 0 {
        return Vec::new();
    }
    let count = tasks.len();
    let mut remaining = tasks.into_iter();
    workers
        .iter()
        .map(|worker| {
            let share = (worker.cores * count).div_ceil(total_cores);
            Assignment {
                worker: worker.id,
                tasks: remaining.by_ref().take(share).collect(),
            }
        })
        .filter(|assignment| !assignment.tasks.is_empty())
        .collect()
}

/// Coordinator bound to a server.
pub struct Coordinator {
    server: Arc<Server>,
    workers: Arc<Mutex<BTreeMap<ConnectionId, usize>>>,
    next_task_id: AtomicU64,
    call_timeout: Duration,
}

impl Coordinator {
    /// Register the handshake handler on `server`.
    ///
    /// `default_cores` replaces a reported core count of zero.
    pub fn new(
        server: Arc<Server>,
        default_cores: usize,
        call_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let workers = Arc::new(Mutex::new(BTreeMap::new()));
        let registry = Arc::clone(&workers);
        let default_cores = default_cores.max(1);
        server.handlers().register(
            HELLO,
            handler_fn(move |body: Bytes, from: ConnectionId| {
                let registry = Arc::clone(&registry);
                async move {
                    let hello: Hello = protocol::decode("hello", &body)
                        .map_err(|err| HandlerError::failed(err.to_string()))?;
                    let cores = if hello.cores == 0 {
                        warn!(worker = %from, default_cores, "worker reported 0 cores, using default");
                        default_cores
                    } else {
                        hello.cores
                    };
                    let _ = registry.lock().insert(from, cores);
                    info!(worker = %from, cores, "worker registered");
                    protocol::encode(
                        "welcome",
                        &Welcome {
                            session_id: from.get(),
                            cores,
                        },
                    )
                    .map_err(|err| HandlerError::failed(err.to_string()))
                }
            }),
        )?;
        Ok(Self {
            server,
            workers,
            next_task_id: AtomicU64::new(0),
            call_timeout,
        })
    }

    /// Workers with a live connection, by connection id.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        let sessions = self.server.sessions();
        let mut workers = self.workers.lock();
        workers.retain(|id, _| sessions.contains(*id));
        workers
            .iter()
            .map(|(&id, &cores)| WorkerInfo { id, cores })
            .collect()
    }

    /// Wait until at least `min` workers registered or `wait` elapses.
    /// Returns the number registered.
    pub async fn wait_for_workers(&self, min: usize, wait: Duration) -> usize {
        let deadline = Instant::now() + wait;
        loop {
            let count = self.workers().len();
            if count >= min || Instant::now() >= deadline {
                info!(count, min, "worker wait finished");
                return count;
            }
            tokio::time::sleep(WORKER_POLL_INTERVAL).await;
        }
    }

    /// Integrate `1 / ln(x)` over `[lower, upper]` across all workers.
    pub async fn integrate(&self, lower: f64, upper: f64, step: f64) -> IntegrationReport {
        info!(lower, upper, step, "integration requested");
        let workers = self.workers();
        if workers.is_empty() {
            warn!("no workers connected");
            return IntegrationReport::default();
        }
        let total_cores: usize = workers.iter().map(|w| w.cores).sum();
        let tasks = divide(lower, upper, step, total_cores);
        if tasks.is_empty() {
            warn!(lower, upper, step, "nothing to integrate");
            return IntegrationReport::default();
        }
        info!(workers = workers.len(), total_cores, tasks = tasks.len(), "job divided");

        let mut report = IntegrationReport::default();
        let mut issued: Vec<(IntegrationTask, ConnectionId, PendingCall)> = Vec::new();
        for assignment in assign(&workers, tasks) {
            info!(worker = %assignment.worker, tasks = assignment.tasks.len(), "assigning tasks");
            for mut task in assignment.tasks {
                task.task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
                report.tasks += 1;
                let body = match protocol::encode("task", &task) {
                    Ok(body) => body,
                    Err(err) => {
                        report.failed.push(TaskFailure {
                            task_id: task.task_id,
                            worker: assignment.worker,
                            error: err.to_string(),
                        });
                        continue;
                    }
                };
                let call = self
                    .server
                    .call(assignment.worker, INTEGRATE, body, self.call_timeout);
                issued.push((task, assignment.worker, call));
            }
        }

        for (task, worker, call) in issued {
            let outcome = match call.await {
                Ok(body) => protocol::decode::<IntegrationResult>("result", &body)
                    .map_err(|err| err.to_string())
                    .and_then(|result| {
                        if result.task_id == task.task_id {
                            Ok(result.value)
                        } else {
                            Err(format!("result for task {} instead", result.task_id))
                        }
                    }),
                Err(err) => Err(err.to_string()),
            };
            match outcome {
                Ok(value) => {
                    info!(task_id = task.task_id, %worker, value, "task finished");
                    report.value += value;
                }
                Err(error) => {
                    warn!(task_id = task.task_id, %worker, %error, "task failed");
                    report.failed.push(TaskFailure {
                        task_id: task.task_id,
                        worker,
                        error,
                    });
                }
            }
        }

        info!(
            value = report.value,
            tasks = report.tasks,
            failed = report.failed.len(),
            "integration finished"
        );
        report
    }
}
