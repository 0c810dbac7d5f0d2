//! Leader election over the shared storage.
//!
//! Any number of schedulers call [`LeadershipEngine::try_to_take_leadership`]
//! once per poll cycle; storage enforces at most one master at a time.
//! Liveness is TTL-based: a leader that stops refreshing its lock is
//! resigned by whichever peer sweeps next.

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::events::{EventPublisher, WorkflowEvent};
use crate::storage::Storage;

pub struct LeadershipEngine {
    storage: Arc<dyn Storage>,
    events: EventPublisher,
}

impl LeadershipEngine {
    pub fn new(storage: Arc<dyn Storage>, events: EventPublisher) -> Self {
        Self { storage, events }
    }

    /// Attempt to take (or keep) master status for this scheduler id.
    ///
    /// Sweeps TTL-expired leaders and refreshes this scheduler's own lock
    /// concurrently, then runs the exclusive compare-and-set. The `NewLeader`
    /// event is emitted on every attempt, whether or not the CAS succeeded:
    /// it is an attempt signal, not a correctness guarantee.
    pub async fn try_to_take_leadership(&self, scheduler_id: &str) -> Result<bool> {
        let own_ids = [scheduler_id.to_string()];
        let (dead_leaders_resigned, refresh) = tokio::join!(
            self.storage.resign_dead_leaders(),
            self.storage.refresh_schedulers_locks(&own_ids),
        );
        let dead_leaders_resigned = dead_leaders_resigned?;
        refresh?;

        if dead_leaders_resigned > 0 {
            self.events.publish(WorkflowEvent::DeadLeader);
            info!("the leader was found dead");
        }

        let got_leadership = self
            .storage
            .try_to_set_master_scheduler(scheduler_id)
            .await?;

        self.events.publish(WorkflowEvent::NewLeader {
            scheduler_id: scheduler_id.to_string(),
        });

        Ok(got_leadership)
    }
}
