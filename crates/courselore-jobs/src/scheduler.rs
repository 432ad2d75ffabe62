//! Process-wide owner of the background worker.

use std::sync::Arc;

use tokio::sync::{broadcast, Notify};
use tracing::info;

use courselore_core::{Error, Result};

use crate::worker::{JobWorker, WorkerEvent, WorkerHandle};

enum State {
    Ready(JobWorker),
    Running(WorkerHandle),
    Stopped,
}

/// Explicit start/wake/shutdown lifecycle around a [`JobWorker`].
pub struct Scheduler {
    state: State,
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(worker: JobWorker) -> Self {
        let wake = worker.wake_handle();
        Self {
            state: State::Ready(worker),
            wake,
        }
    }

    /// Spawn the worker loop. A scheduler starts once.
    pub fn start(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Ready(worker) => {
                self.state = State::Running(worker.start());
                info!(subsystem = "jobs", component = "scheduler", "Scheduler started");
                Ok(())
            }
            other => {
                self.state = other;
                Err(Error::Internal("scheduler already started".into()))
            }
        }
    }

    /// Nudge the worker out of its idle sleep.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Worker events, once started.
    pub fn events(&self) -> Option<broadcast::Receiver<WorkerEvent>> {
        match &self.state {
            State::Running(handle) => Some(handle.events()),
            _ => None,
        }
    }

    /// Stop the worker and wait for its loop to exit.
    pub async fn shutdown(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running(handle) => {
                // The loop may already have exited (disabled worker).
                let _ = handle.shutdown().await;
                handle.join().await?;
                info!(subsystem = "jobs", component = "scheduler", "Scheduler stopped");
                Ok(())
            }
            State::Ready(_) | State::Stopped => Ok(()),
        }
    }
}
