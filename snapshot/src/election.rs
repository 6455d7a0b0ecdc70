//! Election of the instance that plans and exports the snapshot.

use tracing::info;

use crate::error::SnapshotResult;
use crate::source::base::SnapshotSource;

/// Result of an election attempt.
#[derive(Debug)]
pub enum Election<L> {
    /// This instance won. The lock is held for as long as the lease lives.
    Coordinator(L),
    /// Another instance holds the lock. This instance only claims chunks.
    Worker,
}

impl<L> Election<L> {
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Election::Coordinator(_))
    }
}

/// Elects a coordinator per endpoint through a non-blocking advisory lock on the source.
#[derive(Debug, Clone)]
pub struct CoordinatorElector<S> {
    source: S,
}

impl<S> CoordinatorElector<S>
where
    S: SnapshotSource,
{
    pub fn new(source: S) -> Self {
        Self { source }
    }

    fn lock_key(endpoint: &str) -> String {
        format!("snapshot:{endpoint}")
    }

    /// Tries to become the coordinator of `endpoint` without waiting.
    pub async fn try_elect(&self, endpoint: &str) -> SnapshotResult<Election<S::Lease>> {
        match self.source.try_advisory_lock(&Self::lock_key(endpoint)).await? {
            Some(lease) => {
                info!(endpoint, "elected as snapshot coordinator");
                Ok(Election::Coordinator(lease))
            }
            None => {
                info!(endpoint, "another instance coordinates the snapshot, joining as worker");
                Ok(Election::Worker)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemorySource;

    #[tokio::test]
    async fn one_coordinator_per_endpoint() {
        let source = MemorySource::new();
        let electors = (0..3)
            .map(|_| CoordinatorElector::new(source.clone()))
            .collect::<Vec<_>>();

        let mut elections = Vec::new();
        for elector in &electors {
            elections.push(elector.try_elect("orders_slot").await.unwrap());
        }
        assert_eq!(elections.iter().filter(|e| e.is_coordinator()).count(), 1);

        // Another endpoint has its own coordinator.
        assert!(
            electors[1]
                .try_elect("users_slot")
                .await
                .unwrap()
                .is_coordinator()
        );

        // Once the coordinator is gone, the next attempt wins.
        elections.clear();
        assert!(
            electors[2]
                .try_elect("orders_slot")
                .await
                .unwrap()
                .is_coordinator()
        );
    }
}
