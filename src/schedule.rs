//! Background threads that run a job repeatedly.
//!
//! ```ignore
//! let task = RepeatingTask::spawn(
//!     "outbox-drain",
//!     Trigger::FixedDelay(Duration::from_secs(5)),
//!     move || { let _ = drainer.drain(); },
//! )?;
//! // ...
//! let stats = task.stop();
//! ```

use std::io;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tracing::{debug, info, warn};

/// When a [`RepeatingTask`] runs its job.
#[derive(Clone, Debug)]
pub enum Trigger {
    /// Run immediately, then wait this long after each run completes.
    FixedDelay(Duration),
    /// Run at every upcoming occurrence of the schedule (UTC).
    Cron(Schedule),
}

impl Trigger {
    /// Time to wait before the next run, or `None` if there is none.
    fn next_wait(&self, runs: usize) -> Option<Duration> {
        match self {
            Trigger::FixedDelay(_) if runs == 0 => Some(Duration::ZERO),
            Trigger::FixedDelay(delay) => Some(*delay),
            Trigger::Cron(schedule) => {
                let now = Utc::now();
                let next = schedule.after(&now).next()?;
                Some((next - now).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

/// Statistics from a stopped task.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    pub runs: usize,
}

/// A named thread running one job per tick. Runs never overlap.
pub struct RepeatingTask {
    name: String,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<TaskStats>>,
}

impl RepeatingTask {
    pub fn spawn<F>(name: impl Into<String>, trigger: Trigger, mut job: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = channel::<()>();
        let task_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut stats = TaskStats::default();
            debug!(task = %task_name, ?trigger, "Task started");

            loop {
                let Some(wait) = trigger.next_wait(stats.runs) else {
                    info!(task = %task_name, "Schedule has no upcoming runs, stopping");
                    break;
                };

                match stop_rx.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                job();
                stats.runs += 1;
            }

            debug!(task = %task_name, runs = stats.runs, "Task stopped");
            stats
        })?;

        Ok(Self {
            name,
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the task to stop without waiting. A run in progress finishes.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Stop the task, wait for the current run to finish, and return stats.
    pub fn stop(mut self) -> TaskStats {
        self.signal_stop();
        self.join()
    }

    fn join(&mut self) -> TaskStats {
        let Some(handle) = self.handle.take() else {
            return TaskStats::default();
        };
        match handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                warn!(task = %self.name, "Task thread panicked");
                TaskStats::default()
            }
        }
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.signal_stop();
            self.join();
        }
    }
}
