use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use crate::bootstrap::AuthBootstrapCoordinator;
use crate::store::ActiveOrgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Bootstrap has not completed yet; token remembered for comparison.
    NotBootstrapped,
    /// Token identical to the last-known one; no work done.
    Unchanged,
    /// Rotated token pushed into the established session.
    Refreshed,
    /// The IdP reported the session as ended.
    SessionEnded,
}

impl RotationOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotBootstrapped => "not_bootstrapped",
            Self::Unchanged => "unchanged",
            Self::Refreshed => "refreshed",
            Self::SessionEnded => "session_ended",
        }
    }
}

/// Keeps the backend credential aligned with the IdP token after bootstrap.
/// Subscribed to the IdP's token-change channel; events before the first
/// completed bootstrap are remembered but otherwise ignored, and unchanged
/// tokens never trigger any session update.
pub struct TokenRotationListener {
    receiver: watch::Receiver<Option<String>>,
}

impl TokenRotationListener {
    #[must_use]
    pub fn new(receiver: watch::Receiver<Option<String>>) -> Self {
        Self { receiver }
    }

    /// Apply one token-change notification to the coordinator.
    pub fn observe<S: ActiveOrgStore>(
        coordinator: &mut AuthBootstrapCoordinator<S>,
        token: Option<&str>,
    ) -> RotationOutcome {
        let Some(token) = token else {
            debug!("identity session ended; nothing to synchronize");
            return RotationOutcome::SessionEnded;
        };
        if !coordinator.is_session_ready() {
            coordinator.remember_idp_token(token);
            debug!("token rotated before bootstrap completed; remembered for comparison");
            return RotationOutcome::NotBootstrapped;
        }
        if coordinator.session().last_idp_token() == Some(token) {
            debug!("rotated token matches last-known token; skipping refresh");
            return RotationOutcome::Unchanged;
        }
        coordinator.refresh_access_token(token);
        info!("pushed rotated identity token into backend session");
        RotationOutcome::Refreshed
    }

    /// Drive the listener until the IdP drops its notification channel.
    pub async fn run<S: ActiveOrgStore>(
        mut self,
        coordinator: Arc<Mutex<AuthBootstrapCoordinator<S>>>,
    ) {
        while self.receiver.changed().await.is_ok() {
            let token = self.receiver.borrow_and_update().clone();
            let mut coordinator = coordinator.lock().await;
            Self::observe(&mut coordinator, token.as_deref());
        }
        debug!("identity token channel closed; rotation listener stopping");
    }
}
