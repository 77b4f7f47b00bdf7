//! Task scheduling module
//!
//! Provides cron-like task scheduling for periodic operations.

mod scheduler;

pub use scheduler::{Job, JobHandle, Scheduler, SchedulerError};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::reaper::Reaper;

/// Registers and owns the periodic jobs the core needs once it's running:
/// currently just the Reaper's TTL sweep, on a configurable interval.
pub struct CronRegistry {
    scheduler: Arc<Scheduler>,
    reaper: Arc<Reaper>,
    handles: RwLock<Vec<JobHandle>>,
}

impl CronRegistry {
    pub fn new(reaper: Arc<Reaper>) -> Self {
        Self {
            scheduler: Arc::new(Scheduler::new()),
            reaper,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Start the Reaper's sweep job at the given interval.
    pub async fn start(&self, sweep_interval: Duration) {
        let mut handles = self.handles.write().await;

        let reaper = self.reaper.clone();
        handles.push(
            self.scheduler
                .schedule("environment_ttl_sweep", sweep_interval, move || {
                    let reaper = reaper.clone();
                    async move {
                        reaper.sweep().await;
                    }
                })
                .await,
        );
    }

    pub async fn stop(&self) {
        let handles = self.handles.read().await;
        for handle in handles.iter() {
            handle.cancel();
        }
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }
}
