use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a [`Task`].
///
/// Serialises as its numeric ordinal so both sides of the wire agree on a
/// compact, stable encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum State {
    Pending,
    Scheduled,
    Running,
    Failed,
    Complete,
}

impl From<State> for u8 {
    fn from(state: State) -> u8 {
        match state {
            State::Pending => 0,
            State::Scheduled => 1,
            State::Running => 2,
            State::Failed => 3,
            State::Complete => 4,
        }
    }
}

impl TryFrom<u8> for State {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(State::Pending),
            1 => Ok(State::Scheduled),
            2 => Ok(State::Running),
            3 => Ok(State::Failed),
            4 => Ok(State::Complete),
            other => Err(format!("unknown task state ordinal {other}")),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Pending => "Pending",
            State::Scheduled => "Scheduled",
            State::Running => "Running",
            State::Failed => "Failed",
            State::Complete => "Complete",
        };
        f.write_str(name)
    }
}

/// A single host-port binding observed for a published container port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// The unit of work: one Task maps to one container lifetime.
///
/// The manager mutates the assignment fields (`state` up to Scheduled), the
/// worker mutates the runtime fields (`container_id`, `host_ports`, times).
/// Terminal tasks stay in the store for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub id: Uuid,
    pub container_id: Option<String>,
    pub name: String,
    pub state: State,
    pub image: String,
    pub cpu: f64,
    pub memory: u64,
    pub disk: u64,
    pub exposed_ports: BTreeSet<String>,
    pub host_ports: BTreeMap<String, Vec<PortBinding>>,
    pub restart_policy: String,
    pub env: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub health_check: String,
    pub restart_count: u32,
}

impl Default for Task {
    fn default() -> Self {
        Task {
            id: Uuid::new_v4(),
            container_id: None,
            name: String::new(),
            state: State::Pending,
            image: String::new(),
            cpu: 0.0,
            memory: 0,
            disk: 0,
            exposed_ports: BTreeSet::new(),
            host_ports: BTreeMap::new(),
            restart_policy: String::new(),
            env: Vec::new(),
            start_time: None,
            finish_time: None,
            health_check: String::new(),
            restart_count: 0,
        }
    }
}

/// A request to drive a Task towards a desired state, typically Running or
/// Complete. The embedded Task is a snapshot taken at event creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEvent {
    pub id: Uuid,
    pub state: State,
    pub task: Task,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Default for TaskEvent {
    fn default() -> Self {
        TaskEvent {
            id: Uuid::new_v4(),
            state: State::Pending,
            task: Task::default(),
            timestamp: None,
        }
    }
}

/// Container configuration handed to the runtime adapter.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub name: String,
    pub image: String,
    pub cpu: f64,
    pub memory: u64,
    pub disk: u64,
    pub env: Vec<String>,
    pub exposed_ports: BTreeSet<String>,
    /// One of "", "always", "unless-stopped", "on-failure".
    pub restart_policy: String,
}

impl Config {
    pub fn from_task(task: &Task) -> Self {
        Config {
            name: task.name.clone(),
            image: task.image.clone(),
            cpu: task.cpu,
            memory: task.memory,
            disk: task.disk,
            env: task.env.clone(),
            exposed_ports: task.exposed_ports.clone(),
            restart_policy: task.restart_policy.clone(),
        }
    }
}
