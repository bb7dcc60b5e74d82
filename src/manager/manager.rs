use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::node::Node;
use crate::scheduler::{new_scheduler, Scheduler, SchedulerKind};
use crate::store::{InMemoryStore, Store, StoreError};
use crate::task::{valid_state_transition, State, Task, TaskEvent};
use crate::worker::ApiErrorResponse;

const DISPATCH_INTERVAL: Duration = Duration::from_secs(10);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(15);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Automatic restarts stop once a task has been restarted this many times.
const MAX_RESTARTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no candidate workers for task {0}")]
    NoCandidates(Uuid),
    #[error("task {0} is not assigned to any worker")]
    UnknownWorker(Uuid),
    #[error("task {0} exposes no host port to health-check")]
    MissingHostPort(Uuid),
    #[error("health check of task {task_id} returned status {status}")]
    HealthCheckStatus { task_id: Uuid, status: u16 },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The control plane: accepts task events from users, schedules them onto
/// workers, and converges its view of the cluster towards what the workers
/// report.
pub struct Manager {
    /// Worker endpoints as `host:port`, in registration order.
    pub workers: Vec<String>,
    worker_nodes: Mutex<Vec<Node>>,
    task_worker_map: Mutex<HashMap<Uuid, String>>,
    worker_task_map: Mutex<HashMap<String, Vec<Uuid>>>,
    pending: Mutex<VecDeque<TaskEvent>>,
    task_db: Arc<dyn Store<Task>>,
    event_db: Arc<dyn Store<TaskEvent>>,
    scheduler: tokio::sync::Mutex<Box<dyn Scheduler>>,
    client: reqwest::Client,
}

impl Manager {
    pub fn new(workers: Vec<String>, scheduler: SchedulerKind) -> Self {
        let mut worker_task_map = HashMap::new();
        let mut nodes = Vec::new();
        for worker in &workers {
            worker_task_map.insert(worker.clone(), Vec::new());
            nodes.push(Node::new(worker, &format!("http://{worker}"), "worker"));
        }

        Manager {
            workers,
            worker_nodes: Mutex::new(nodes),
            task_worker_map: Mutex::new(HashMap::new()),
            worker_task_map: Mutex::new(worker_task_map),
            pending: Mutex::new(VecDeque::new()),
            task_db: Arc::new(InMemoryStore::new()),
            event_db: Arc::new(InMemoryStore::new()),
            scheduler: tokio::sync::Mutex::new(new_scheduler(scheduler)),
            client: reqwest::Client::new(),
        }
    }

    /// Accepts a task event onto the pending queue.
    pub fn add_task(&self, event: TaskEvent) {
        debug!(event_id = %event.id, task_id = %event.task.id, "task event queued");
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.push_back(event);
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        self.task_db.list().unwrap_or_else(|err| {
            error!(error = %err, "failed to list tasks");
            Vec::new()
        })
    }

    pub fn task(&self, id: &Uuid) -> Result<Task, StoreError> {
        self.task_db.get(&id.to_string())
    }

    pub fn pending_events(&self) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.len()
    }

    pub fn stored_events(&self) -> usize {
        self.event_db.count().unwrap_or(0)
    }

    pub fn stored_tasks(&self) -> usize {
        self.task_db.count().unwrap_or(0)
    }

    /// The worker a task is assigned to, if any.
    pub fn worker_for(&self, task_id: &Uuid) -> Option<String> {
        let map = self.task_worker_map.lock().unwrap_or_else(|e| e.into_inner());
        map.get(task_id).cloned()
    }

    /// Records an assignment in both directions.
    fn assign(&self, task_id: Uuid, worker: &str) {
        {
            let mut map = self.worker_task_map.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(worker.to_string()).or_default().push(task_id);
        }
        let mut map = self.task_worker_map.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(task_id, worker.to_string());
    }

    /// Runs the scheduling pipeline over the current node list.
    async fn select_worker(&self, task: &Task) -> Result<Node, ManagerError> {
        let nodes = {
            let nodes = self.worker_nodes.lock().unwrap_or_else(|e| e.into_inner());
            nodes.clone()
        };

        let mut scheduler = self.scheduler.lock().await;
        let mut candidates = scheduler.select_candidate_nodes(task, &nodes);
        if candidates.is_empty() {
            return Err(ManagerError::NoCandidates(task.id));
        }

        let scores = scheduler.score(task, &mut candidates).await;
        scheduler
            .pick(&scores, &candidates)
            .ok_or(ManagerError::NoCandidates(task.id))
    }

    /// One dispatch step: pop a pending event, persist it, and either stop
    /// the referenced task or schedule it onto a worker.
    pub async fn send_work(&self) {
        let event = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.pop_front()
        };
        let Some(event) = event else {
            debug!("pending queue is empty, nothing to dispatch");
            return;
        };

        if let Err(err) = self.event_db.put(&event.id.to_string(), event.clone()) {
            error!(event_id = %event.id, error = %err, "failed to persist task event");
        }

        if let Some(worker) = self.worker_for(&event.task.id) {
            let persisted = match self.task_db.get(&event.task.id.to_string()) {
                Ok(task) => task,
                Err(err) => {
                    error!(task_id = %event.task.id, error = %err, "failed to load assigned task");
                    return;
                }
            };

            if event.state == State::Complete
                && valid_state_transition(persisted.state, event.state)
            {
                self.stop_task(&worker, &event.task.id.to_string()).await;
                return;
            }
        }

        let mut task = event.task.clone();
        let node = match self.select_worker(&task).await {
            Ok(node) => node,
            Err(err) => {
                error!(task_id = %task.id, error = %err, "failed to select a worker");
                return;
            }
        };

        self.assign(task.id, &node.name);

        task.state = State::Scheduled;
        if let Err(err) = self.task_db.put(&task.id.to_string(), task.clone()) {
            error!(task_id = %task.id, error = %err, "failed to persist task");
        }

        let url = format!("http://{}/tasks", node.name);
        match self.client.post(&url).json(&event).send().await {
            Err(err) => {
                error!(%url, error = %err, "failed to reach worker, requeuing event");
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.push_back(event);
            }
            Ok(response) if response.status() != StatusCode::CREATED => {
                match response.json::<ApiErrorResponse>().await {
                    Ok(body) => error!(
                        %url,
                        status = body.http_status_code,
                        message = %body.message,
                        "worker rejected task event"
                    ),
                    Err(err) => error!(%url, error = %err, "failed to decode worker error response"),
                }
            }
            Ok(response) => match response.json::<Task>().await {
                Ok(accepted) => {
                    info!(task_id = %accepted.id, worker = %node.name, "task dispatched")
                }
                Err(err) => error!(%url, error = %err, "failed to decode worker response"),
            },
        }
    }

    /// Asks a worker to stop a task gracefully.
    async fn stop_task(&self, worker: &str, task_id: &str) {
        let url = format!("http://{worker}/tasks/{task_id}");
        match self.client.delete(&url).send().await {
            Err(err) => error!(%url, error = %err, "failed to reach worker"),
            Ok(response) if response.status() != StatusCode::NO_CONTENT => {
                error!(%url, status = %response.status(), "worker refused to stop task");
            }
            Ok(_) => info!(%task_id, %worker, "task scheduled to stop"),
        }
    }

    /// One reconciliation pass: pull every worker's task list and converge
    /// the task store towards the reported state. The observed state is
    /// authoritative here and overwrites without a transition check.
    pub async fn update_tasks(&self) {
        for worker in &self.workers {
            debug!(%worker, "fetching tasks for reconciliation");
            let url = format!("http://{worker}/tasks");
            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(err) => {
                    error!(%url, error = %err, "failed to reach worker");
                    continue;
                }
            };
            if response.status() != StatusCode::OK {
                error!(%url, status = %response.status(), "unexpected response listing tasks");
                continue;
            }
            let tasks: Vec<Task> = match response.json().await {
                Ok(tasks) => tasks,
                Err(err) => {
                    error!(%url, error = %err, "failed to decode worker task list");
                    continue;
                }
            };

            for observed in tasks {
                let mut persisted = match self.task_db.get(&observed.id.to_string()) {
                    Ok(task) => task,
                    Err(_) => {
                        warn!(task_id = %observed.id, %worker, "worker reported an unknown task, skipping");
                        continue;
                    }
                };

                if persisted.state != observed.state {
                    persisted.state = observed.state;
                }
                persisted.start_time = observed.start_time;
                persisted.finish_time = observed.finish_time;
                persisted.container_id = observed.container_id;
                persisted.host_ports = observed.host_ports;

                if let Err(err) = self.task_db.put(&persisted.id.to_string(), persisted) {
                    error!(error = %err, "failed to persist reconciled task");
                }
            }
        }
    }

    /// One health-check sweep. The sweep ends at the first failing probe;
    /// remaining tasks wait for the next cycle.
    pub async fn run_health_check(&self) {
        for task in self.get_tasks() {
            if task.state == State::Running && task.restart_count < MAX_RESTARTS {
                if task.health_check.is_empty() {
                    continue;
                }
                if let Err(err) = self.health_check_task(&task).await {
                    warn!(task_id = %task.id, error = %err, "health check failed, restarting task");
                    self.restart_task(&task).await;
                    return;
                }
            } else if task.state == State::Failed && task.restart_count < MAX_RESTARTS {
                self.restart_task(&task).await;
            }
        }
    }

    /// Probes the task's health endpoint through its first published host
    /// port. Port keys are iterated in sorted order so the probe target is
    /// deterministic.
    async fn health_check_task(&self, task: &Task) -> Result<(), ManagerError> {
        let worker = self
            .worker_for(&task.id)
            .ok_or(ManagerError::UnknownWorker(task.id))?;
        let host = worker.split(':').next().unwrap_or(worker.as_str());

        let host_port = task
            .host_ports
            .values()
            .flat_map(|bindings| bindings.iter())
            .map(|binding| binding.host_port.clone())
            .next()
            .ok_or(ManagerError::MissingHostPort(task.id))?;

        let url = format!("http://{host}:{host_port}{}", task.health_check);
        debug!(task_id = %task.id, %url, "probing task health");

        let response = self.client.get(&url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(ManagerError::HealthCheckStatus {
                task_id: task.id,
                status: response.status().as_u16(),
            });
        }

        debug!(task_id = %task.id, "health check passed");
        Ok(())
    }

    /// Re-arms a task on its current worker: no rescheduling, the restart
    /// goes straight back to where the task already lives.
    async fn restart_task(&self, task: &Task) {
        let Some(worker) = self.worker_for(&task.id) else {
            error!(task_id = %task.id, "cannot restart a task with no assigned worker");
            return;
        };

        let mut task = task.clone();
        task.state = State::Scheduled;
        task.restart_count += 1;
        if let Err(err) = self.task_db.put(&task.id.to_string(), task.clone()) {
            error!(task_id = %task.id, error = %err, "failed to persist restarted task");
        }

        let event = TaskEvent {
            id: Uuid::new_v4(),
            state: State::Running,
            task: task.clone(),
            timestamp: Some(Utc::now()),
        };

        let url = format!("http://{worker}/tasks");
        match self.client.post(&url).json(&event).send().await {
            Err(err) => {
                error!(%url, error = %err, "failed to reach worker, requeuing restart");
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.push_back(event);
            }
            Ok(response) if response.status() != StatusCode::CREATED => {
                match response.json::<ApiErrorResponse>().await {
                    Ok(body) => error!(
                        %url,
                        status = body.http_status_code,
                        message = %body.message,
                        "worker rejected restart"
                    ),
                    Err(err) => error!(%url, error = %err, "failed to decode worker error response"),
                }
            }
            Ok(_) => info!(task_id = %task.id, %worker, restart_count = task.restart_count, "task restarted"),
        }
    }

    /// Dispatch loop.
    pub async fn process_tasks(self: Arc<Self>) {
        loop {
            debug!("processing pending task events");
            self.send_work().await;
            tokio::time::sleep(DISPATCH_INTERVAL).await;
        }
    }

    /// Reconciliation loop.
    pub async fn update_tasks_loop(self: Arc<Self>) {
        loop {
            debug!(workers = self.workers.len(), "reconciling tasks across workers");
            self.update_tasks().await;
            tokio::time::sleep(RECONCILE_INTERVAL).await;
        }
    }

    /// Health-check loop.
    pub async fn run_health_checks(self: Arc<Self>) {
        loop {
            self.run_health_check().await;
            tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
        }
    }
}
