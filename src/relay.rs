use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::broker::Broker;
use crate::config::{ConfigError, OutboxConfig};
use crate::drainer::OutboxDrainer;
use crate::schedule::{RepeatingTask, TaskStats, Trigger};
use crate::store::OutboxStore;
use crate::sweeper::RetentionSweeper;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn relay thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Statistics from a stopped relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub drain_runs: usize,
    pub sweep_runs: usize,
}

/// The background half of the outbox: a drain task on a fixed delay and a
/// sweep task on a cron schedule, both built from [`OutboxConfig`].
///
/// ```ignore
/// let relay = OutboxRelay::start(&config, store, broker)?;
/// // ...
/// let stats = relay.stop();
/// ```
pub struct OutboxRelay {
    drain: Option<RepeatingTask>,
    sweep: RepeatingTask,
}

impl OutboxRelay {
    /// Validate `config` and spawn the tasks. The drain task is skipped when
    /// `poller.enabled` is false. `config.enabled` only picks the router's
    /// delivery mode and does not gate the relay: records written before a
    /// switch to direct mode still drain.
    pub fn start<S, B>(config: &OutboxConfig, store: Arc<S>, broker: Arc<B>) -> Result<Self, RelayError>
    where
        S: OutboxStore + 'static,
        B: Broker + 'static,
    {
        config.validate()?;

        let drain = if config.poller.enabled {
            let drainer = OutboxDrainer::new(store.clone(), broker)
                .with_batch_size(config.poller.batch_size)
                .with_max_retry(config.poller.max_retry)
                .with_publish_timeout(config.publish_timeout());
            Some(RepeatingTask::spawn(
                "outbox-drain",
                Trigger::FixedDelay(config.interval()),
                move || {
                    if let Err(err) = drainer.drain() {
                        error!(error = %err, "Outbox drain failed");
                    }
                },
            )?)
        } else {
            None
        };

        let sweeper = RetentionSweeper::new(store).with_retention(config.retention());
        let sweep = RepeatingTask::spawn(
            "outbox-sweep",
            Trigger::Cron(config.cleanup_schedule()?),
            move || {
                if let Err(err) = sweeper.sweep() {
                    error!(error = %err, "Outbox cleanup failed");
                }
            },
        )?;

        info!(
            poller = config.poller.enabled,
            interval_ms = config.poller.interval_ms,
            schedule = %config.cleanup.schedule,
            "Outbox relay started"
        );
        Ok(Self { drain, sweep })
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_some()
    }

    /// Stop both tasks, waiting for runs in progress.
    pub fn stop(self) -> RelayStats {
        if let Some(drain) = &self.drain {
            drain.signal_stop();
        }
        self.sweep.signal_stop();

        let drain_runs = self.drain.map(|task| task.stop().runs).unwrap_or(0);
        let TaskStats { runs: sweep_runs } = self.sweep.stop();
        info!(drain_runs, sweep_runs, "Outbox relay stopped");
        RelayStats {
            drain_runs,
            sweep_runs,
        }
    }
}
