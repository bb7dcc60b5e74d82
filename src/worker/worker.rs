use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::stats::{self, Stats};
use crate::store::{InMemoryStore, Store, StoreError};
use crate::task::{
    valid_state_transition, Config, ContainerInfo, ContainerRuntime, DockerError, State, Task,
};

const DISPATCH_INTERVAL: Duration = Duration::from_secs(10);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(15);
const STATS_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: State, to: State },
    #[error("undefined state {0} for a queued task")]
    UndefinedState(State),
    #[error(transparent)]
    Docker(#[from] DockerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs tasks in containers on this host.
///
/// The queue holds the desired state of tasks handed down by the manager;
/// the store holds their actual state as observed against the container
/// runtime.
pub struct Worker {
    /// This worker's identity, the `host:port` it serves its API on.
    pub name: String,
    queue: Mutex<VecDeque<Task>>,
    db: Arc<dyn Store<Task>>,
    runtime: Arc<dyn ContainerRuntime>,
    stats: RwLock<Stats>,
    sys: Mutex<sysinfo::System>,
}

impl Worker {
    pub fn new(name: &str, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Worker {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            db: Arc::new(InMemoryStore::new()),
            runtime,
            stats: RwLock::new(Stats::default()),
            sys: Mutex::new(sysinfo::System::new_all()),
        }
    }

    /// Appends a task to the queue. The task's embedded state is the state
    /// the caller wants it driven to.
    pub fn add_task(&self, task: Task) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(task);
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        self.db.list().unwrap_or_else(|err| {
            error!(worker = %self.name, error = %err, "failed to list tasks");
            Vec::new()
        })
    }

    pub fn task(&self, id: &Uuid) -> Result<Task, StoreError> {
        self.db.get(&id.to_string())
    }

    pub fn queued_tasks(&self) -> usize {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.len()
    }

    /// The latest host snapshot.
    pub fn stats(&self) -> Stats {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Takes one task off the queue and drives it towards its desired
    /// state. A task the store has not seen before is persisted as-is
    /// first, so the transition check compares against its prior snapshot.
    pub async fn run_next_task(&self) -> Result<(), WorkerError> {
        let queued = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.pop_front()
        };
        let Some(queued) = queued else {
            debug!(worker = %self.name, "no tasks in the queue");
            return Ok(());
        };

        let persisted = match self.db.get(&queued.id.to_string()) {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                self.db.put(&queued.id.to_string(), queued.clone())?;
                queued.clone()
            }
        };

        if !valid_state_transition(persisted.state, queued.state) {
            return Err(WorkerError::InvalidStateTransition {
                from: persisted.state,
                to: queued.state,
            });
        }

        match queued.state {
            State::Scheduled => self.start_task(queued).await,
            State::Complete => self.stop_task(queued).await,
            state => Err(WorkerError::UndefinedState(state)),
        }
    }

    async fn start_task(&self, mut task: Task) -> Result<(), WorkerError> {
        task.start_time = Some(Utc::now());
        let config = Config::from_task(&task);

        match self.runtime.run(&config).await {
            Ok(container_id) => {
                info!(worker = %self.name, task_id = %task.id, %container_id, "task started");
                task.state = State::Running;
                task.container_id = Some(container_id);
                self.db.put(&task.id.to_string(), task)?;
                Ok(())
            }
            Err(err) => {
                error!(worker = %self.name, task_id = %task.id, error = %err, "failed to start task");
                task.state = State::Failed;
                self.db.put(&task.id.to_string(), task)?;
                Err(WorkerError::Docker(err))
            }
        }
    }

    async fn stop_task(&self, mut task: Task) -> Result<(), WorkerError> {
        let container_id = task
            .container_id
            .clone()
            .ok_or(DockerError::MissingContainerId)?;

        if let Err(err) = self.runtime.stop(&container_id).await {
            error!(worker = %self.name, task_id = %task.id, error = %err, "failed to stop container");
        }

        task.state = State::Complete;
        task.finish_time = Some(Utc::now());
        self.db.put(&task.id.to_string(), task.clone())?;
        info!(worker = %self.name, task_id = %task.id, %container_id, "task stopped and removed");
        Ok(())
    }

    /// Queries the runtime for the container backing `task`.
    pub async fn inspect_task(&self, task: &Task) -> Result<Option<ContainerInfo>, DockerError> {
        let Some(container_id) = &task.container_id else {
            return Ok(None);
        };
        self.runtime.inspect(container_id).await
    }

    /// One reconciliation pass: converge the store towards what the
    /// runtime reports for every task believed to be running.
    pub async fn reconcile_tasks(&self) {
        for task in self.get_tasks() {
            if task.state != State::Running {
                continue;
            }

            match self.inspect_task(&task).await {
                Err(err) => {
                    warn!(worker = %self.name, task_id = %task.id, error = %err, "failed to inspect container");
                }
                Ok(None) => {
                    warn!(worker = %self.name, task_id = %task.id, "container is gone, marking task failed");
                    self.fail_task(task);
                }
                Ok(Some(container)) if container.status == "exited" => {
                    warn!(
                        worker = %self.name,
                        task_id = %task.id,
                        status = %container.status,
                        "container is not running, marking task failed"
                    );
                    self.fail_task(task);
                }
                Ok(Some(container)) => {
                    let mut task = task;
                    task.host_ports = container.ports;
                    if let Err(err) = self.db.put(&task.id.to_string(), task) {
                        error!(worker = %self.name, error = %err, "failed to persist task");
                    }
                }
            }
        }
    }

    fn fail_task(&self, mut task: Task) {
        task.state = State::Failed;
        if let Err(err) = self.db.put(&task.id.to_string(), task) {
            error!(worker = %self.name, error = %err, "failed to persist task");
        }
    }

    /// Refreshes the host snapshot and stamps it with the running task
    /// count.
    pub fn refresh_stats(&self) {
        let task_count = self
            .get_tasks()
            .iter()
            .filter(|task| task.state == State::Running)
            .count();

        let snapshot = {
            let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
            stats::collect(&mut sys, task_count)
        };

        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        *stats = snapshot;
    }

    /// Dispatch loop: one task per tick.
    pub async fn run_tasks(self: Arc<Self>) {
        loop {
            if let Err(err) = self.run_next_task().await {
                error!(worker = %self.name, error = %err, "failed to process queued task");
            }
            tokio::time::sleep(DISPATCH_INTERVAL).await;
        }
    }

    /// Reconciliation loop.
    pub async fn update_tasks(self: Arc<Self>) {
        loop {
            debug!(worker = %self.name, "reconciling tasks against the runtime");
            self.reconcile_tasks().await;
            tokio::time::sleep(RECONCILE_INTERVAL).await;
        }
    }

    /// Stats collection loop.
    pub async fn collect_stats(self: Arc<Self>) {
        loop {
            debug!(worker = %self.name, "collecting host stats");
            self.refresh_stats();
            tokio::time::sleep(STATS_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::task::PortBinding;

    #[derive(Default)]
    struct FakeRuntime {
        run_calls: AtomicUsize,
        fail_run: bool,
        inspect_result: Mutex<Option<ContainerInfo>>,
        stopped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn run(&self, config: &Config) -> Result<String, DockerError> {
            self.run_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_run {
                return Err(DockerError::MissingContainerId);
            }
            Ok(format!("container-{}", config.name))
        }

        async fn stop(&self, container_id: &str) -> Result<(), DockerError> {
            self.stopped
                .lock()
                .unwrap()
                .push(container_id.to_string());
            Ok(())
        }

        async fn inspect(&self, _container_id: &str) -> Result<Option<ContainerInfo>, DockerError> {
            Ok(self.inspect_result.lock().unwrap().clone())
        }
    }

    fn scheduled_task(name: &str) -> Task {
        Task {
            name: name.to_string(),
            state: State::Scheduled,
            image: "strm/helloworld-http".to_string(),
            ..Task::default()
        }
    }

    #[tokio::test]
    async fn scheduled_task_starts_and_runs() {
        let runtime = Arc::new(FakeRuntime::default());
        let worker = Worker::new("w1", runtime.clone());

        let task = scheduled_task("t1");
        worker.add_task(task.clone());
        worker.run_next_task().await.unwrap();

        let stored = worker.task(&task.id).unwrap();
        assert_eq!(stored.state, State::Running);
        assert_eq!(stored.container_id.as_deref(), Some("container-t1"));
        assert!(stored.start_time.is_some());
        assert_eq!(runtime.run_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_start_marks_the_task_failed() {
        let runtime = Arc::new(FakeRuntime {
            fail_run: true,
            ..FakeRuntime::default()
        });
        let worker = Worker::new("w1", runtime);

        let task = scheduled_task("t1");
        worker.add_task(task.clone());
        assert!(worker.run_next_task().await.is_err());

        let stored = worker.task(&task.id).unwrap();
        assert_eq!(stored.state, State::Failed);
        assert!(stored.container_id.is_none());
    }

    #[tokio::test]
    async fn complete_task_stops_its_container() {
        let runtime = Arc::new(FakeRuntime::default());
        let worker = Worker::new("w1", runtime.clone());

        let task = scheduled_task("t1");
        worker.add_task(task.clone());
        worker.run_next_task().await.unwrap();

        let mut stop = worker.task(&task.id).unwrap();
        stop.state = State::Complete;
        worker.add_task(stop);
        worker.run_next_task().await.unwrap();

        let stored = worker.task(&task.id).unwrap();
        assert_eq!(stored.state, State::Complete);
        assert!(stored.finish_time.is_some());
        assert_eq!(
            runtime.stopped.lock().unwrap().as_slice(),
            ["container-t1".to_string()]
        );
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_without_touching_the_runtime() {
        let runtime = Arc::new(FakeRuntime::default());
        let worker = Worker::new("w1", runtime.clone());

        let mut task = scheduled_task("t1");
        task.state = State::Complete;
        task.container_id = Some("container-t1".to_string());
        worker.db.put(&task.id.to_string(), task.clone()).unwrap();

        let mut resubmit = task.clone();
        resubmit.state = State::Scheduled;
        worker.add_task(resubmit);

        let err = worker.run_next_task().await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::InvalidStateTransition {
                from: State::Complete,
                to: State::Scheduled,
            }
        ));
        assert_eq!(worker.task(&task.id).unwrap().state, State::Complete);
        assert_eq!(runtime.run_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_submission_starts_only_one_container() {
        let runtime = Arc::new(FakeRuntime::default());
        let worker = Worker::new("w1", runtime.clone());

        let task = scheduled_task("t1");
        worker.add_task(task.clone());
        worker.add_task(task.clone());

        worker.run_next_task().await.unwrap();
        // The second copy arrives while the task is Running; Running does
        // not transition back to Scheduled.
        assert!(worker.run_next_task().await.is_err());
        assert_eq!(runtime.run_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undefined_queue_state_is_rejected() {
        let runtime = Arc::new(FakeRuntime::default());
        let worker = Worker::new("w1", runtime);

        let mut task = scheduled_task("t1");
        worker.db.put(&task.id.to_string(), task.clone()).unwrap();
        task.state = State::Failed;
        worker.add_task(task);

        let err = worker.run_next_task().await.unwrap_err();
        assert!(matches!(err, WorkerError::UndefinedState(State::Failed)));
    }

    #[tokio::test]
    async fn empty_queue_is_a_quiet_noop() {
        let runtime = Arc::new(FakeRuntime::default());
        let worker = Worker::new("w1", runtime);
        assert!(worker.run_next_task().await.is_ok());
        assert_eq!(worker.queued_tasks(), 0);
    }

    #[tokio::test]
    async fn reconcile_fails_tasks_whose_container_vanished() {
        let runtime = Arc::new(FakeRuntime::default());
        let worker = Worker::new("w1", runtime.clone());

        let task = scheduled_task("t1");
        worker.add_task(task.clone());
        worker.run_next_task().await.unwrap();

        *runtime.inspect_result.lock().unwrap() = None;
        worker.reconcile_tasks().await;

        assert_eq!(worker.task(&task.id).unwrap().state, State::Failed);
    }

    #[tokio::test]
    async fn reconcile_fails_exited_containers() {
        let runtime = Arc::new(FakeRuntime::default());
        let worker = Worker::new("w1", runtime.clone());

        let task = scheduled_task("t1");
        worker.add_task(task.clone());
        worker.run_next_task().await.unwrap();

        *runtime.inspect_result.lock().unwrap() = Some(ContainerInfo {
            status: "exited".to_string(),
            ports: BTreeMap::new(),
        });
        worker.reconcile_tasks().await;

        assert_eq!(worker.task(&task.id).unwrap().state, State::Failed);
    }

    #[tokio::test]
    async fn reconcile_copies_host_ports_from_a_healthy_container() {
        let runtime = Arc::new(FakeRuntime::default());
        let worker = Worker::new("w1", runtime.clone());

        let task = scheduled_task("t1");
        worker.add_task(task.clone());
        worker.run_next_task().await.unwrap();

        let ports = BTreeMap::from([(
            "80/tcp".to_string(),
            vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: "49153".to_string(),
            }],
        )]);
        *runtime.inspect_result.lock().unwrap() = Some(ContainerInfo {
            status: "running".to_string(),
            ports: ports.clone(),
        });
        worker.reconcile_tasks().await;

        let stored = worker.task(&task.id).unwrap();
        assert_eq!(stored.state, State::Running);
        assert_eq!(stored.host_ports, ports);
    }

    #[tokio::test]
    async fn stats_are_stamped_with_the_running_task_count() {
        let runtime = Arc::new(FakeRuntime::default());
        let worker = Worker::new("w1", runtime);

        let task = scheduled_task("t1");
        worker.add_task(task);
        worker.run_next_task().await.unwrap();
        worker.refresh_stats();

        assert_eq!(worker.stats().task_count, 1);
    }
}
