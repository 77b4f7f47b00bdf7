//! Concurrency Governor
//!
//! Two bounded admission queues (setup, execution) generalizing the
//! single-permit mutual-exclusion lock this project's ancestor uses for
//! power operations, plus a per-environment in-flight counter the Reaper
//! consults before reaping a volume out from under a running execution.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error("operation cancelled while waiting for admission")]
    Cancelled,
}

/// Admission permit; releases its semaphore slot when dropped.
pub struct AdmissionGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

pub struct Governor {
    setup: Semaphore,
    execution: Semaphore,
    in_flight: DashMap<Uuid, Arc<AtomicU32>>,
}

impl Governor {
    pub fn new(setup_capacity: usize, execution_capacity: usize) -> Self {
        Self {
            setup: Semaphore::new(setup_capacity),
            execution: Semaphore::new(execution_capacity),
            in_flight: DashMap::new(),
        }
    }

    pub async fn admit_setup(
        &self,
        ctx: &CancellationToken,
    ) -> Result<AdmissionGuard<'_>, GovernorError> {
        tokio::select! {
            permit = self.setup.acquire() => {
                Ok(AdmissionGuard { _permit: permit.expect("semaphore never closed") })
            }
            _ = ctx.cancelled() => Err(GovernorError::Cancelled),
        }
    }

    pub async fn admit_execution(
        &self,
        ctx: &CancellationToken,
    ) -> Result<AdmissionGuard<'_>, GovernorError> {
        tokio::select! {
            permit = self.execution.acquire() => {
                Ok(AdmissionGuard { _permit: permit.expect("semaphore never closed") })
            }
            _ = ctx.cancelled() => Err(GovernorError::Cancelled),
        }
    }

    /// Mark one execution as starting against `environment_id`. The guard
    /// decrements the counter on drop, keeping this safe on every exit path
    /// (success, error, panic-unwind through a spawned task's join).
    pub fn enter_execution(&self, environment_id: Uuid) -> InFlightGuard<'_> {
        let counter = self
            .in_flight
            .entry(environment_id)
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter,
            _governor: self,
        }
    }

    /// Whether the Reaper may safely remove this environment right now.
    pub fn is_idle(&self, environment_id: &Uuid) -> bool {
        self.in_flight
            .get(environment_id)
            .map(|c| c.load(Ordering::SeqCst) == 0)
            .unwrap_or(true)
    }
}

pub struct InFlightGuard<'a> {
    counter: Arc<AtomicU32>,
    _governor: &'a Governor,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admission_bounds_concurrency() {
        let governor = Governor::new(1, 1);
        let ctx = CancellationToken::new();

        let _g1 = governor.admit_setup(&ctx).await.unwrap();
        assert_eq!(governor.setup.available_permits(), 0);
        drop(_g1);
        assert_eq!(governor.setup.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_admission_cancelled() {
        let governor = Governor::new(1, 1);
        let ctx = CancellationToken::new();
        let _held = governor.admit_execution(&ctx).await.unwrap();

        ctx.cancel();
        let result = governor.admit_execution(&ctx).await;
        assert!(matches!(result, Err(GovernorError::Cancelled)));
    }

    #[test]
    fn test_in_flight_guard_tracks_idleness() {
        let governor = Governor::new(5, 5);
        let id = Uuid::new_v4();
        assert!(governor.is_idle(&id));

        let guard = governor.enter_execution(id);
        assert!(!governor.is_idle(&id));

        drop(guard);
        assert!(governor.is_idle(&id));
    }
}
