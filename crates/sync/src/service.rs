use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use devcell_core::remote::{RemoteConnector, RemoteError, RemoteRepository};
use devcell_core::{ProjectId, RepoFile, UserId};

use crate::error::{SyncError, SyncResult};
use crate::pipeline::{CommitOutcome, PipelineConfig, PullStatus, RepositorySyncPipeline};
use crate::store::{ProjectLink, SyncStore};

/// Project-level sync operations on top of [`RepositorySyncPipeline`].
///
/// Owns the per-user client cache and reads/writes the project's
/// `{repositoryId, lastSyncedSha}` through a [`SyncStore`].
pub struct SyncService {
    store: Arc<dyn SyncStore>,
    connector: Arc<dyn RemoteConnector>,
    config: PipelineConfig,
    clients: Mutex<HashMap<UserId, Arc<dyn RemoteRepository>>>,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn SyncStore>,
        connector: Arc<dyn RemoteConnector>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            connector,
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn client_for(&self, user_id: &UserId) -> SyncResult<Arc<dyn RemoteRepository>> {
        if let Some(client) = self.cached_client(user_id) {
            return Ok(client);
        }
        let token = self.store.user_token(user_id)?;
        let client = self
            .connector
            .connect(token.as_deref())
            .map_err(|e| match e {
                RemoteError::Unauthorized => SyncError::Unauthenticated,
                other => SyncError::Remote(other),
            })?;
        debug!(user_id = %user_id, "created repository client");
        self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(user_id.clone(), client.clone());
        Ok(client)
    }

    fn cached_client(&self, user_id: &UserId) -> Option<Arc<dyn RemoteRepository>> {
        self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(user_id)
            .cloned()
    }

    fn pipeline_for(&self, user_id: &UserId) -> SyncResult<RepositorySyncPipeline> {
        Ok(RepositorySyncPipeline::new(
            self.client_for(user_id)?,
            self.config.clone(),
        ))
    }

    fn link(&self, project_id: &ProjectId) -> SyncResult<ProjectLink> {
        self.store
            .project_link(project_id)?
            .ok_or_else(|| SyncError::NotLinked(project_id.clone()))
    }

    pub fn linked_repository(&self, project_id: &ProjectId) -> SyncResult<Option<ProjectLink>> {
        Ok(self.store.project_link(project_id)?)
    }

    /// Link `repository_id` to the project after checking it resolves.
    pub async fn link_repo(
        &self,
        user_id: &UserId,
        project_id: &ProjectId,
        repository_id: &str,
    ) -> SyncResult<String> {
        let client = self.client_for(user_id)?;
        let name = client
            .resolve_repo(repository_id)
            .await?
            .ok_or_else(|| SyncError::RepositoryNotFound(repository_id.to_string()))?;
        self.store.set_project_repo(project_id, repository_id)?;
        info!(project_id = %project_id, repository_id, repo = %name, "linked repository");
        Ok(name)
    }

    pub fn remove_repo(&self, project_id: &ProjectId) -> SyncResult<()> {
        self.store.clear_project_repo(project_id)?;
        info!(project_id = %project_id, "unlinked repository");
        Ok(())
    }

    /// Persist a fresh credential; the next operation builds a new client.
    pub fn set_user_token(&self, user_id: &UserId, token: &str) -> SyncResult<()> {
        self.store.set_user_token(user_id, token)?;
        self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(user_id);
        Ok(())
    }

    /// Drop the cached client and persist an empty credential so later
    /// operations re-authenticate instead of reusing a stale client.
    pub fn logout_user(&self, user_id: &UserId) -> SyncResult<()> {
        self.set_user_token(user_id, "")?;
        info!(user_id = %user_id, "logged out of repository service");
        Ok(())
    }

    pub async fn check_if_pull_needed(
        &self,
        user_id: &UserId,
        project_id: &ProjectId,
    ) -> SyncResult<PullStatus> {
        let link = self.link(project_id)?;
        self.pipeline_for(user_id)?
            .check_if_pull_needed(&link.repository_id, link.last_synced_sha.as_deref())
            .await
    }

    pub async fn get_latest_files(
        &self,
        user_id: &UserId,
        project_id: &ProjectId,
    ) -> SyncResult<Vec<RepoFile>> {
        let link = self.link(project_id)?;
        self.pipeline_for(user_id)?
            .get_latest_files(&link.repository_id)
            .await
    }

    /// Sync `files` as one commit.
    ///
    /// Runs the divergence check first; unless `resolved` is set, a remote
    /// head that differs from the last synced commit fails with
    /// [`SyncError::PullRequired`]. On success the new head is stored as
    /// the project's last synced commit.
    pub async fn create_commit(
        &self,
        user_id: &UserId,
        project_id: &ProjectId,
        files: &[RepoFile],
        message: &str,
        resolved: bool,
    ) -> SyncResult<CommitOutcome> {
        let link = self.link(project_id)?;
        let pipeline = self.pipeline_for(user_id)?;

        let status = pipeline
            .check_if_pull_needed(&link.repository_id, link.last_synced_sha.as_deref())
            .await?;
        if status.needs_pull && !resolved {
            warn!(
                project_id = %project_id,
                remote = %status.remote_sha,
                "sync blocked: remote diverged"
            );
            return Err(SyncError::PullRequired(Box::new(status)));
        }

        let outcome = pipeline
            .create_commit(&link.repository_id, files, message)
            .await?;
        self.store
            .set_last_synced_sha(project_id, &outcome.commit_sha)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use devcell_core::remote::RemoteResult;
    use devcell_core::testing::numbered_files;

    use crate::testing::{MemoryRemote, MemorySyncStore};

    struct SharedRemote {
        remote: Arc<MemoryRemote>,
        connects: Mutex<usize>,
    }

    impl RemoteConnector for SharedRemote {
        fn connect(&self, token: Option<&str>) -> RemoteResult<Arc<dyn RemoteRepository>> {
            token.ok_or(RemoteError::Unauthorized)?;
            *self.connects.lock().unwrap() += 1;
            Ok(self.remote.clone())
        }
    }

    struct Fixture {
        remote: Arc<MemoryRemote>,
        store: Arc<MemorySyncStore>,
        connector: Arc<SharedRemote>,
        service: SyncService,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_repo("42", "acme/site", &[("README.md", "# site\n")]);
        let store = Arc::new(MemorySyncStore::new());
        store.set_user_token("owner", "ghp_owner").unwrap();
        let connector = Arc::new(SharedRemote {
            remote: remote.clone(),
            connects: Mutex::new(0),
        });
        let config = PipelineConfig {
            batch_delay: Duration::from_millis(10),
            ..PipelineConfig::default()
        };
        let service = SyncService::new(store.clone(), connector.clone(), config);
        Fixture {
            remote,
            store,
            connector,
            service,
        }
    }

    fn owner() -> UserId {
        "owner".to_string()
    }

    fn project() -> ProjectId {
        "p1".to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn first_sync_requires_resolution_then_records_head() {
        let f = fixture();
        f.service.link_repo(&owner(), &project(), "42").await.unwrap();

        let err = f
            .service
            .create_commit(&owner(), &project(), &numbered_files(2), "Sync", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PullRequired(_)), "got: {err}");

        let outcome = f
            .service
            .create_commit(&owner(), &project(), &numbered_files(2), "Sync", true)
            .await
            .unwrap();
        let link = f.store.project_link(&project()).unwrap().unwrap();
        assert_eq!(link.last_synced_sha.as_deref(), Some(outcome.commit_sha.as_str()));

        // In step with the remote now: no resolution needed.
        f.service
            .create_commit(&owner(), &project(), &numbered_files(1), "Again", false)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn external_push_blocks_unresolved_sync() {
        let f = fixture();
        f.service.link_repo(&owner(), &project(), "42").await.unwrap();
        f.service
            .create_commit(&owner(), &project(), &numbered_files(1), "Sync", true)
            .await
            .unwrap();

        let pushed = f.remote.push_external("acme/site", "main", "README.md", "# edited\n");
        let status = f
            .service
            .check_if_pull_needed(&owner(), &project())
            .await
            .unwrap();
        assert!(status.needs_pull);
        assert_eq!(status.remote_sha, pushed);

        let err = f
            .service
            .create_commit(&owner(), &project(), &numbered_files(1), "Sync", false)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PullRequired(ref s) if s.remote_sha == pushed));
    }

    #[tokio::test]
    async fn unlinked_project_and_unknown_repository() {
        let f = fixture();
        let err = f
            .service
            .check_if_pull_needed(&owner(), &project())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotLinked(_)), "got: {err}");

        let err = f
            .service
            .link_repo(&owner(), &project(), "999")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RepositoryNotFound(_)), "got: {err}");
        assert!(f.store.project_link(&project()).unwrap().is_none());
    }

    #[tokio::test]
    async fn logout_drops_client_and_clears_credential() {
        let f = fixture();
        f.service.link_repo(&owner(), &project(), "42").await.unwrap();
        f.service.check_if_pull_needed(&owner(), &project()).await.unwrap();
        assert_eq!(*f.connector.connects.lock().unwrap(), 1);

        f.service.logout_user(&owner()).unwrap();
        assert_eq!(f.store.raw_token("owner").as_deref(), Some(""));

        let err = f
            .service
            .check_if_pull_needed(&owner(), &project())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unauthenticated), "got: {err}");
    }

    #[tokio::test]
    async fn remove_repo_unlinks_project() {
        let f = fixture();
        f.service.link_repo(&owner(), &project(), "42").await.unwrap();
        f.service.remove_repo(&project()).unwrap();
        assert!(f.service.linked_repository(&project()).unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_files_come_from_linked_repository() {
        let f = fixture();
        f.service.link_repo(&owner(), &project(), "42").await.unwrap();
        let files = f.service.get_latest_files(&owner(), &project()).await.unwrap();
        assert_eq!(files, vec![RepoFile::new("README.md", "# site\n")]);
    }
}
