use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use validator_protocol::{RunEvent, ValidatorCommand};

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ActiveRun {
    pub(crate) id: Uuid,
    pub(crate) command: ValidatorCommand,
    pub(crate) operator: String,
    pub(crate) started_at: String,
    #[serde(skip)]
    started: Instant,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct FinishedRun {
    pub(crate) id: Uuid,
    pub(crate) command: ValidatorCommand,
    pub(crate) succeeded: bool,
    pub(crate) error: Option<String>,
    pub(crate) finished_at: String,
    pub(crate) duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct StatusSnapshot {
    pub(crate) running: bool,
    pub(crate) current_command: Option<ValidatorCommand>,
    pub(crate) active: Vec<ActiveRun>,
    pub(crate) last_run: Option<FinishedRun>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum RegistryError {
    #[error("A command is already running: {current}")]
    Busy { current: ValidatorCommand },
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<Uuid, ActiveRun>,
    last_run: Option<FinishedRun>,
}

/// Runs currently in flight, keyed by run id.
pub(crate) struct RunRegistry {
    capacity: usize,
    state: Mutex<RegistryState>,
}

impl RunRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims a slot for `command`. The slot is released when the ticket is dropped.
    pub(crate) fn try_begin(
        self: &Arc<Self>,
        command: ValidatorCommand,
        operator: &str,
    ) -> Result<RunTicket, RegistryError> {
        let mut state = self.lock();
        if state.active.len() >= self.capacity {
            let current = oldest(&state.active)
                .map(|run| run.command)
                .unwrap_or(command);
            return Err(RegistryError::Busy { current });
        }
        let id = Uuid::new_v4();
        state.active.insert(
            id,
            ActiveRun {
                id,
                command,
                operator: operator.to_string(),
                started_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
                started: Instant::now(),
            },
        );
        Ok(RunTicket {
            registry: Arc::clone(self),
            id,
            command,
        })
    }

    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        let state = self.lock();
        let mut active: Vec<ActiveRun> = state.active.values().cloned().collect();
        active.sort_by_key(|run| run.started);
        StatusSnapshot {
            running: !active.is_empty(),
            current_command: active.first().map(|run| run.command),
            active,
            last_run: state.last_run.clone(),
        }
    }
}

fn oldest(active: &HashMap<Uuid, ActiveRun>) -> Option<&ActiveRun> {
    active.values().min_by_key(|run| run.started)
}

pub(crate) struct RunTicket {
    registry: Arc<RunRegistry>,
    id: Uuid,
    command: ValidatorCommand,
}

impl RunTicket {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Records the terminal event as the last finished run and frees the slot.
    pub(crate) fn finish(self, terminal: &RunEvent) {
        let mut state = self.registry.lock();
        let duration_ms = state
            .active
            .get(&self.id)
            .map(|run| run.started.elapsed().as_millis() as u64)
            .unwrap_or_default();
        let error = match terminal {
            RunEvent::Failed { error, .. } => Some(error.clone()),
            _ => None,
        };
        state.last_run = Some(FinishedRun {
            id: self.id,
            command: self.command,
            succeeded: matches!(terminal, RunEvent::Completed { .. }),
            error,
            finished_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            duration_ms,
        });
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.registry.lock().active.remove(&self.id);
    }
}
