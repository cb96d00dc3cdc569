//! Orchestration between the local catalog and the remote registry.
//!
//! `SyncCoordinator` borrows a [`CatalogStore`] and a [`RegistryClient`] and
//! drives the miss path: a local hit is served from the store; on a miss the
//! client's download pipeline writes the fetched artifact back into the
//! store, which then answers as the source of truth.

use crate::artifact::{Artifact, ArtifactKind};
use crate::error::Result;
use crate::registry::RegistryClient;
use crate::store::CatalogStore;

pub struct SyncCoordinator<'a> {
    store: &'a mut CatalogStore,
    client: &'a RegistryClient,
}

impl<'a> SyncCoordinator<'a> {
    /// Pair a store with a client. Persisted auth keys are handed to the
    /// client so remote calls authenticate without a fresh probe.
    pub fn new(store: &'a mut CatalogStore, client: &'a RegistryClient) -> Self {
        client.restore_auth_keys(store.prod_auth_key(), store.dev_auth_key());
        Self { store, client }
    }

    /// Serve an artifact from the store, downloading it on a miss.
    ///
    /// After a download the store is queried again, so the returned artifact
    /// is always the store's own view. `Err` only for a busy client or an
    /// invalid identifier; a failed download is a plain `None`.
    pub async fn get_or_fetch(
        &mut self,
        kind: ArtifactKind,
        uid: &str,
        version_id: Option<&str>,
    ) -> Result<Option<Artifact>> {
        if let Some(found) = self.store.get(kind, uid, version_id) {
            return Ok(Some(found));
        }

        tracing::debug!("{kind} {uid} not cached, fetching from registry");
        if self.client.download_artifact(self.store, uid).await?.is_none() {
            return Ok(None);
        }
        Ok(self.store.get(kind, uid, version_id))
    }

    /// Bring every locally stored artifact of `kind` up to its latest
    /// registry revision. Returns how many were updated.
    ///
    /// Superseded revisions are removed only after their replacement has
    /// been downloaded and registered; a failed download leaves the local
    /// artifact at its prior version.
    pub async fn update_all(&mut self, kind: ArtifactKind) -> Result<usize> {
        let updates = self.client.check_for_updates(self.store, kind).await?;
        if updates.is_empty() {
            return Ok(0);
        }

        let mut updated = 0;
        for remote in updates {
            let Some(new) = self.client.download_artifact(self.store, &remote.uid).await? else {
                tracing::warn!("Update of {} failed, keeping prior version", remote.uid);
                continue;
            };
            let removed = self.store.remove_outdated(kind, &new.uid, &new.version_id);
            tracing::info!(
                "Updated {} {} to {} ({removed} superseded revision(s) removed)",
                kind,
                new.uid,
                new.version_id
            );
            updated += 1;
        }
        Ok(updated)
    }

    /// Validate a production auth key against the registry and, on success,
    /// persist it in the store's settings.
    pub async fn set_prod_auth_key(&mut self, key: &str) -> bool {
        self.client.set_prod_auth_key(key).await && self.store.set_prod_auth_key(key)
    }

    /// Validate a development auth key against the registry and, on success,
    /// persist it in the store's settings.
    pub async fn set_dev_auth_key(&mut self, key: &str) -> bool {
        self.client.set_dev_auth_key(key).await && self.store.set_dev_auth_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DepotError;
    use crate::registry::RegistryConfig;
    use tempfile::TempDir;

    fn store_with(artifact: Option<&Artifact>) -> (TempDir, CatalogStore) {
        let dir = TempDir::new().unwrap();
        let mut store = CatalogStore::open(dir.path()).unwrap();
        if let Some(artifact) = artifact {
            assert!(store.add(artifact));
        }
        (dir, store)
    }

    fn client() -> RegistryClient {
        RegistryClient::new(RegistryConfig::default()).unwrap()
    }

    fn sample() -> Artifact {
        let mut artifact = Artifact::new(ArtifactKind::Measure, "Roof-R30");
        artifact.uid = "u1".to_string();
        artifact.version_id = "v1".to_string();
        artifact
    }

    #[tokio::test]
    async fn local_hit_is_served_without_network() {
        let artifact = sample();
        let (_dir, mut store) = store_with(Some(&artifact));
        let client = client();
        // A held permit would turn any network attempt into Busy.
        let _outstanding = client.hold_in_flight();

        let mut coordinator = SyncCoordinator::new(&mut store, &client);
        let found = coordinator
            .get_or_fetch(ArtifactKind::Measure, "u1", Some("v1"))
            .await
            .unwrap();
        assert_eq!(found.unwrap().name, "Roof-R30");
    }

    #[tokio::test]
    async fn miss_with_busy_client_reports_busy() {
        let (_dir, mut store) = store_with(None);
        let client = client();
        let _outstanding = client.hold_in_flight();

        let mut coordinator = SyncCoordinator::new(&mut store, &client);
        let err = coordinator
            .get_or_fetch(ArtifactKind::Component, "missing", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::Busy));
    }

    #[tokio::test]
    async fn update_all_on_empty_store_does_nothing() {
        let (_dir, mut store) = store_with(None);
        let client = client();
        let _outstanding = client.hold_in_flight();

        let mut coordinator = SyncCoordinator::new(&mut store, &client);
        // No local artifacts means no per-uid searches, so the held permit
        // is never contended.
        let updated = coordinator.update_all(ArtifactKind::Measure).await.unwrap();
        assert_eq!(updated, 0);
    }

    #[tokio::test]
    async fn coordinator_hands_persisted_keys_to_client() {
        let (_dir, mut store) = store_with(None);
        assert!(store.set_prod_auth_key("0123456789abcdef0123456789abcdef"));
        let client = client();

        let _coordinator = SyncCoordinator::new(&mut store, &client);
        assert_eq!(client.prod_auth_key(), "0123456789abcdef0123456789abcdef");
    }
}
