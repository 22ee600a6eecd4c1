use std::sync::Arc;

use super::{Lease, StoreKey};
use crate::error::Result;
use crate::store::DocumentStore;

/// Read-only views over the lease documents of one processor.
pub struct LeaseContainer {
    store: Arc<dyn DocumentStore>,
    prefix: String,
}

impl LeaseContainer {
    pub fn new(store: Arc<dyn DocumentStore>, prefix: String) -> Self {
        Self { store, prefix }
    }

    pub async fn all_leases(&self) -> Result<Vec<Lease>> {
        let info = StoreKey::Info.resolve(&self.prefix);
        let lock = StoreKey::Lock.resolve(&self.prefix);
        self.store
            .query_prefix(&StoreKey::LeasesPrefix.resolve(&self.prefix))
            .await?
            .iter()
            .filter(|doc| doc.key != info && doc.key != lock)
            .map(Lease::from_document)
            .collect()
    }

    pub async fn owned_leases(&self, worker: &str) -> Result<Vec<Lease>> {
        Ok(self
            .all_leases()
            .await?
            .into_iter()
            .filter(|lease| lease.is_owned_by(worker))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::lease::{LeaseManager, LeaseStore};
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn bookkeeping_documents_are_not_leases() {
        let store = Arc::new(InMemoryStore::new());
        let prefix = "cf".to_string();
        let manager = LeaseManager::new(store.clone(), prefix.clone(), "a".into());
        let lease_store = LeaseStore::new(store.clone(), prefix.clone(), "a".into());
        let container = LeaseContainer::new(store.clone(), prefix);

        let zero = manager.create_lease_if_not_exist("0", None).await.unwrap().unwrap();
        manager.create_lease_if_not_exist("1", None).await.unwrap();
        manager.acquire(&zero).await.unwrap();
        lease_store.mark_initialized().await.unwrap();
        lease_store
            .acquire_initialization_lock(Duration::from_secs(30))
            .await
            .unwrap();
        lease_store.register_worker(Duration::from_secs(30)).await.unwrap();

        let all: Vec<_> = container
            .all_leases()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.partition_token)
            .collect();
        assert_eq!(all, vec!["0", "1"]);

        let owned = container.owned_leases("a").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].partition_token, "0");
        assert!(container.owned_leases("b").await.unwrap().is_empty());
    }
}
