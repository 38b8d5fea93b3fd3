use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::BackendTransport;
use crate::bootstrap::{
    AuthBootstrapCoordinator, AutoJoinOutcome, BootstrapError, BootstrapOutcome,
};
use crate::identity::IdentitySession;
use crate::rotation::TokenRotationListener;
use crate::store::ActiveOrgStore;

/// Per-tab wiring: owns the coordinator behind a task-safe handle and runs
/// the rotation listener next to it. The surrounding application calls
/// [`SessionManager::try_auto_join`] when the IdP session becomes available
/// and [`SessionManager::select_organization`] when the user picks one.
pub struct SessionManager<S: ActiveOrgStore> {
    coordinator: Arc<Mutex<AuthBootstrapCoordinator<S>>>,
    identity: Arc<dyn IdentitySession>,
}

impl<S: ActiveOrgStore + Send + 'static> SessionManager<S> {
    pub fn new(
        backend: Arc<dyn BackendTransport>,
        identity: Arc<dyn IdentitySession>,
        org_store: S,
    ) -> Self {
        let coordinator = AuthBootstrapCoordinator::new(
            Arc::clone(&backend),
            Arc::clone(&identity),
            org_store,
        );
        Self {
            coordinator: Arc::new(Mutex::new(coordinator)),
            identity,
        }
    }

    #[must_use]
    pub fn coordinator(&self) -> Arc<Mutex<AuthBootstrapCoordinator<S>>> {
        Arc::clone(&self.coordinator)
    }

    /// Subscribe to IdP token changes and keep the backend credential fresh
    /// for the lifetime of the tab.
    pub fn spawn_rotation_listener(&self) -> JoinHandle<()> {
        let listener = TokenRotationListener::new(self.identity.subscribe());
        info!("starting token rotation listener");
        tokio::spawn(listener.run(self.coordinator()))
    }

    /// Fast-path entry for a freshly opened tab.
    pub async fn try_auto_join(&self) -> Result<AutoJoinOutcome, BootstrapError> {
        self.coordinator.lock().await.auto_join().await
    }

    /// Interactive entry after the user selected an organization.
    pub async fn select_organization(
        &self,
        org_id: &str,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        self.coordinator.lock().await.bootstrap(org_id).await
    }

    pub async fn sign_out(&self) {
        self.coordinator.lock().await.sign_out().await;
    }

    pub async fn is_session_ready(&self) -> bool {
        self.coordinator.lock().await.is_session_ready()
    }

    /// Current backend access credential, if a session is established.
    pub async fn access_token(&self) -> Option<String> {
        self.coordinator
            .lock()
            .await
            .session()
            .access_token()
            .map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendError, CreateUserOutcome, CreateUserRequest, EnsureOrgOutcome, LoginOutcome,
        LoginRequest, WhoamiOutcome,
    };
    use crate::bootstrap::AutoJoinSkipReason;
    use crate::identity::{IdentityProfile, StaticIdentitySession};
    use crate::store::MemoryActiveOrgStore;
    use async_trait::async_trait;

    struct UnreachableBackend;

    #[async_trait]
    impl BackendTransport for UnreachableBackend {
        async fn whoami(&self, _bearer_token: &str) -> Result<WhoamiOutcome, BackendError> {
            Err(BackendError::Request {
                message: "unexpected whoami".to_string(),
            })
        }

        async fn create_user(
            &self,
            _bearer_token: &str,
            _request: &CreateUserRequest,
        ) -> Result<CreateUserOutcome, BackendError> {
            Err(BackendError::Request {
                message: "unexpected create_user".to_string(),
            })
        }

        async fn ensure_organization(
            &self,
            _bearer_token: &str,
        ) -> Result<EnsureOrgOutcome, BackendError> {
            Err(BackendError::Request {
                message: "unexpected ensure_organization".to_string(),
            })
        }

        async fn login(
            &self,
            _bearer_token: &str,
            _request: &LoginRequest,
        ) -> Result<LoginOutcome, BackendError> {
            Err(BackendError::Request {
                message: "unexpected login".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn auto_join_without_identity_org_makes_no_backend_calls() {
        let identity = Arc::new(StaticIdentitySession::new(
            IdentityProfile::default(),
            "tok_1",
        ));
        let manager = SessionManager::new(
            Arc::new(UnreachableBackend),
            identity,
            MemoryActiveOrgStore::new(),
        );

        let outcome = manager.try_auto_join().await.expect("skip is not an error");
        assert_eq!(
            outcome,
            AutoJoinOutcome::Skipped(AutoJoinSkipReason::NoIdentityOrg)
        );
        assert!(!manager.is_session_ready().await);
        assert_eq!(manager.access_token().await, None);
    }

    #[tokio::test]
    async fn sign_out_resets_local_state_and_ends_identity_session() {
        let identity = Arc::new(StaticIdentitySession::new(
            IdentityProfile::default(),
            "tok_1",
        ));
        let store = MemoryActiveOrgStore::with_active_org("org_1");
        let manager = SessionManager::new(
            Arc::new(UnreachableBackend),
            Arc::clone(&identity) as Arc<dyn IdentitySession>,
            store.clone(),
        );

        manager.sign_out().await;
        assert!(!manager.is_session_ready().await);
        assert_eq!(identity.get_token().await, None);
        assert_eq!(store.load_active_org().map(|r| r.org_id), Ok(None));
    }
}
