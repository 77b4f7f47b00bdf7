//! Reaper — TTL eviction and boot-time reconciliation.
//!
//! Periodically removes environments past their TTL, skipping any that
//! still have an execution in flight, and on startup diffs the runtime's
//! volumes against the store so a crash mid-setup or mid-teardown doesn't
//! leave either side holding state the other doesn't know about.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::builder::now_unix;
use crate::governor::Governor;
use crate::runtime::{ContainerRuntime, VOLUME_PREFIX};
use crate::store::Store;

pub struct Reaper {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<Store>,
    governor: Arc<Governor>,
}

impl Reaper {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<Store>, governor: Arc<Governor>) -> Self {
        Self {
            runtime,
            store,
            governor,
        }
    }

    /// One eviction pass: delete every expired, idle environment. Expired
    /// environments still running an execution are left for the next tick.
    pub async fn sweep(&self) {
        let expired = {
            let envs = self.store.environments().await;
            match envs.list_expired(now_unix()) {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "reaper: failed to list expired environments");
                    return;
                }
            }
        };

        for env in expired {
            if !self.governor.is_idle(&env.id) {
                info!(environment_id = %env.id, "reaper: skipping expired environment, execution in flight");
                continue;
            }

            if let Err(e) = self.runtime.remove_volume(&env.volume_name).await {
                warn!(environment_id = %env.id, error = %e, "reaper: failed to remove volume");
                continue;
            }

            let envs = self.store.environments().await;
            if let Err(e) = envs.delete(&env.id) {
                warn!(environment_id = %env.id, error = %e, "reaper: failed to delete environment record");
                continue;
            }

            info!(environment_id = %env.id, "reaper: evicted expired environment");
        }
    }

    /// Boot-time reconciliation: reconcile drift between the store and the
    /// runtime's volumes in both directions.
    ///
    /// - A volume on the backend with no matching store row is an orphan
    ///   from a crash between `create_volume` and the store insert; remove it.
    /// - A store row with no matching volume is an orphan from a crash
    ///   after the volume was removed but before the row was deleted; mark
    ///   it gone by deleting the row, since the environment can never serve
    ///   another execution without its volume.
    pub async fn reconcile(&self) {
        let backend_volumes: HashSet<String> = match self.runtime.list_volumes().await {
            Ok(list) => list
                .into_iter()
                .filter(|name| name.starts_with(VOLUME_PREFIX))
                .collect(),
            Err(e) => {
                warn!(error = %e, "reaper: failed to list volumes for reconciliation");
                return;
            }
        };

        let stored = {
            let envs = self.store.environments().await;
            match envs.list() {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "reaper: failed to list environments for reconciliation");
                    return;
                }
            }
        };

        let stored_volumes: HashSet<String> = stored.iter().map(|e| e.volume_name.clone()).collect();

        for orphan_volume in backend_volumes.difference(&stored_volumes) {
            warn!(volume = %orphan_volume, "reaper: removing orphaned volume with no environment record");
            if let Err(e) = self.runtime.remove_volume(orphan_volume).await {
                warn!(volume = %orphan_volume, error = %e, "reaper: failed to remove orphaned volume");
            }
        }

        for env in &stored {
            if !backend_volumes.contains(&env.volume_name) {
                warn!(environment_id = %env.id, "reaper: environment record has no backing volume, dropping record");
                let envs = self.store.environments().await;
                if let Err(e) = envs.delete(&env.id) {
                    warn!(environment_id = %env.id, error = %e, "reaper: failed to drop orphaned environment record");
                }
            }
        }

        info!(
            backend_volumes = backend_volumes.len(),
            stored_environments = stored.len(),
            "reaper: boot reconciliation complete"
        );
    }

    #[allow(dead_code)]
    fn is_managed(name: &str) -> bool {
        name.starts_with(VOLUME_PREFIX)
    }

    #[allow(dead_code)]
    fn parse_environment_id(volume_name: &str) -> Option<Uuid> {
        volume_name.strip_prefix(VOLUME_PREFIX).and_then(|s| Uuid::parse_str(s).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_managed_filters_by_prefix() {
        assert!(Reaper::is_managed("tee-env-abc"));
        assert!(!Reaper::is_managed("some-other-volume"));
    }

    #[test]
    fn test_parse_environment_id_roundtrips() {
        let id = Uuid::new_v4();
        let name = format!("{VOLUME_PREFIX}{id}");
        assert_eq!(Reaper::parse_environment_id(&name), Some(id));
    }
}
