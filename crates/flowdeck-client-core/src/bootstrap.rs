use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{
    BackendError, BackendTransport, BackendUser, CreateUserOutcome, CreateUserRequest,
    EnsureOrgOutcome, LoginOutcome, LoginRequest, TokenPair, WhoamiOutcome,
};
use crate::identity::{IdentitySession, derive_username};
use crate::session::SessionContext;
use crate::store::{ActiveOrgRecord, ActiveOrgStore, TabLocalState};

pub const CONFLICT_RETRY_ATTEMPTS: usize = 3;
pub const CONFLICT_RETRY_PAUSE_MS: u64 = 250;

/// Lookup retry budget applied when user creation loses a cross-tab race.
#[derive(Debug, Clone, Copy)]
pub struct ConflictRetryPolicy {
    pub attempts: usize,
    pub pause: Duration,
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: CONFLICT_RETRY_ATTEMPTS,
            pause: Duration::from_millis(CONFLICT_RETRY_PAUSE_MS),
        }
    }
}

/// Coordinator phases. `committed` flips once the login exchange has
/// succeeded for the current attempt; failures before that point tear the
/// session down, failures after it are logged and swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    Idle,
    Bootstrapping { committed: bool },
    Recovering { committed: bool },
    Bootstrapped,
    Failed,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("identity_token_unavailable")]
    IdentityTokenUnavailable,
    #[error("login_unauthorized")]
    LoginUnauthorized,
    #[error("user_conflict_unresolved_after_{attempts}_lookups")]
    ConflictUnresolved { attempts: usize },
    #[error("active_org_store_failed:{message}")]
    Store { message: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Completed,
    AlreadyInFlight,
    AlreadyBootstrapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoJoinOutcome {
    Completed,
    Recovered,
    Skipped(AutoJoinSkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoJoinSkipReason {
    AlreadyAttempted,
    BootstrapActive,
    OrgAlreadySelected,
    NoIdentityOrg,
    IdentityOrgNotLoaded,
    NoStoredOrg,
    StoredOrgMismatch,
}

impl AutoJoinSkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyAttempted => "already_attempted",
            Self::BootstrapActive => "bootstrap_active",
            Self::OrgAlreadySelected => "org_already_selected",
            Self::NoIdentityOrg => "no_identity_org",
            Self::IdentityOrgNotLoaded => "identity_org_not_loaded",
            Self::NoStoredOrg => "no_stored_org",
            Self::StoredOrgMismatch => "stored_org_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureUserOutcome {
    pub already_existed: bool,
    pub user: BackendUser,
}

/// Per-tab state machine that turns an IdP session into an organization
/// scoped backend session. Owned by one task; the in-flight guard only
/// protects against re-entrant calls from that task, never across tabs.
pub struct AuthBootstrapCoordinator<S: ActiveOrgStore> {
    backend: Arc<dyn BackendTransport>,
    identity: Arc<dyn IdentitySession>,
    org_store: S,
    tab: TabLocalState,
    session: SessionContext,
    phase: BootstrapPhase,
    auto_join_attempted: bool,
    retry: ConflictRetryPolicy,
}

impl<S: ActiveOrgStore> AuthBootstrapCoordinator<S> {
    pub fn new(
        backend: Arc<dyn BackendTransport>,
        identity: Arc<dyn IdentitySession>,
        org_store: S,
    ) -> Self {
        Self {
            backend,
            identity,
            org_store,
            tab: TabLocalState::default(),
            session: SessionContext::new(),
            phase: BootstrapPhase::Idle,
            auto_join_attempted: false,
            retry: ConflictRetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: ConflictRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn phase(&self) -> BootstrapPhase {
        self.phase
    }

    #[must_use]
    pub fn tab_state(&self) -> TabLocalState {
        self.tab
    }

    #[must_use]
    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// True once bootstrap has completed and a backend session is held.
    #[must_use]
    pub fn is_session_ready(&self) -> bool {
        self.tab.org_selected && self.session.is_established()
    }

    /// Record an IdP token seen before bootstrap completed, for later
    /// comparison by the rotation listener.
    pub fn remember_idp_token(&mut self, idp_token: &str) {
        self.session.remember_idp_token(idp_token);
    }

    /// Swap a rotated IdP token into the established session. Provisioning
    /// is not re-run; only the access credential changes.
    pub fn refresh_access_token(&mut self, idp_token: &str) {
        self.session.refresh_access_token(idp_token);
    }

    /// Run the full bootstrap sequence for an explicitly selected
    /// organization. No-op while a previous attempt is still in flight or
    /// after the tab has bootstrapped.
    pub async fn bootstrap(
        &mut self,
        desired_org_id: &str,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        if self.tab.bootstrap_in_flight {
            debug!("bootstrap already in flight; ignoring duplicate request");
            return Ok(BootstrapOutcome::AlreadyInFlight);
        }
        if self.phase == BootstrapPhase::Bootstrapped {
            debug!("tab already bootstrapped; ignoring duplicate request");
            return Ok(BootstrapOutcome::AlreadyBootstrapped);
        }

        self.tab.bootstrap_in_flight = true;
        self.phase = BootstrapPhase::Bootstrapping { committed: false };
        info!(org_id = desired_org_id, "starting session bootstrap");

        let result = self.run_bootstrap(desired_org_id).await;
        self.tab.bootstrap_in_flight = false;

        match result {
            Ok(()) => {
                self.phase = BootstrapPhase::Bootstrapped;
                info!(org_id = desired_org_id, "session bootstrap complete");
                Ok(BootstrapOutcome::Completed)
            }
            Err(error) if self.committed() => {
                // Login already succeeded; destroying the session over a
                // cosmetic follow-up failure would be worse than the failure.
                warn!(%error, "ignoring post-login bootstrap failure; keeping session");
                self.phase = BootstrapPhase::Bootstrapped;
                Ok(BootstrapOutcome::Completed)
            }
            Err(error) => {
                warn!(%error, "bootstrap failed before login; signing out of identity provider");
                self.sign_out().await;
                self.phase = BootstrapPhase::Failed;
                Err(error)
            }
        }
    }

    async fn run_bootstrap(&mut self, desired_org_id: &str) -> Result<(), BootstrapError> {
        let idp_token = self
            .identity
            .get_token()
            .await
            .ok_or(BootstrapError::IdentityTokenUnavailable)?;

        match self.backend.ensure_organization(&idp_token).await? {
            EnsureOrgOutcome::Created => info!(org_id = desired_org_id, "organization created"),
            EnsureOrgOutcome::AlreadyExists => {
                debug!(org_id = desired_org_id, "organization already linked");
            }
        }

        let username = derive_username(&self.identity.profile());
        let ensured = self.ensure_user(&idp_token, &username).await?;
        debug!(
            username = %ensured.user.username,
            already_existed = ensured.already_existed,
            "backend user ready"
        );

        let tokens = self.delegated_login(&idp_token, &username).await?;
        self.commit(tokens, idp_token, desired_org_id)
    }

    /// Fast path for a new tab: skip interactive organization selection when
    /// the cross-tab record names the organization the IdP session is a
    /// member of. Runs at most once per tab.
    pub async fn auto_join(&mut self) -> Result<AutoJoinOutcome, BootstrapError> {
        let org = match self.auto_join_precondition()? {
            Ok(org) => org,
            Err(reason) => {
                debug!(reason = reason.as_str(), "skipping auto-join");
                return Ok(AutoJoinOutcome::Skipped(reason));
            }
        };

        self.auto_join_attempted = true;
        self.tab.bootstrap_in_flight = true;
        self.phase = BootstrapPhase::Bootstrapping { committed: false };
        info!(org_id = %org.id, "auto-joining previously active organization");

        let result = self.run_auto_join(&org.id).await;
        self.tab.bootstrap_in_flight = false;

        match result {
            Ok(recovered) => {
                self.phase = BootstrapPhase::Bootstrapped;
                info!(org_id = %org.id, recovered, "auto-join complete");
                Ok(if recovered {
                    AutoJoinOutcome::Recovered
                } else {
                    AutoJoinOutcome::Completed
                })
            }
            Err(error) if self.committed() => {
                warn!(%error, "ignoring post-login auto-join failure; keeping session");
                self.phase = BootstrapPhase::Bootstrapped;
                Ok(AutoJoinOutcome::Completed)
            }
            Err(error) => {
                // Unlike interactive bootstrap, a failed auto-join keeps the
                // IdP session: the tab falls back to interactive selection.
                warn!(%error, "auto-join failed; falling back to interactive selection");
                self.session.clear();
                self.tab.reset();
                self.phase = BootstrapPhase::Failed;
                Err(error)
            }
        }
    }

    fn auto_join_precondition(
        &self,
    ) -> Result<Result<crate::identity::IdentityOrg, AutoJoinSkipReason>, BootstrapError> {
        if self.auto_join_attempted {
            return Ok(Err(AutoJoinSkipReason::AlreadyAttempted));
        }
        if self.tab.bootstrap_in_flight || self.phase != BootstrapPhase::Idle {
            return Ok(Err(AutoJoinSkipReason::BootstrapActive));
        }
        if self.tab.org_selected {
            return Ok(Err(AutoJoinSkipReason::OrgAlreadySelected));
        }
        let Some(org) = self.identity.organization() else {
            return Ok(Err(AutoJoinSkipReason::NoIdentityOrg));
        };
        if !org.loaded {
            return Ok(Err(AutoJoinSkipReason::IdentityOrgNotLoaded));
        }
        let stored = self
            .org_store
            .load_active_org()
            .map_err(|error| BootstrapError::Store {
                message: error.to_string(),
            })?;
        let Some(stored_org_id) = stored.org_id else {
            return Ok(Err(AutoJoinSkipReason::NoStoredOrg));
        };
        if stored_org_id != org.id {
            debug!(
                stored = %stored_org_id,
                current = %org.id,
                "stored organization does not match identity session"
            );
            return Ok(Err(AutoJoinSkipReason::StoredOrgMismatch));
        }
        Ok(Ok(org))
    }

    async fn run_auto_join(&mut self, org_id: &str) -> Result<bool, BootstrapError> {
        let idp_token = self
            .identity
            .get_token()
            .await
            .ok_or(BootstrapError::IdentityTokenUnavailable)?;
        let username = derive_username(&self.identity.profile());

        match self
            .backend
            .login(&idp_token, &LoginRequest::delegated(&username))
            .await?
        {
            LoginOutcome::Tokens(tokens) => {
                self.commit(tokens, idp_token, org_id)?;
                Ok(false)
            }
            LoginOutcome::Unauthorized => {
                // Valid IdP session, no backend session: the backend lost
                // state (for example a storage reset). Self-heal by running
                // the full provisioning chain with the still-valid token.
                info!("backend has no session for a valid identity session; reprovisioning");
                self.phase = BootstrapPhase::Recovering { committed: false };
                let tokens = self.reprovision(&idp_token, &username).await?;
                self.commit(tokens, idp_token, org_id)?;
                Ok(true)
            }
        }
    }

    /// Recovery chain for stale backend state: ensure-user with retry, a
    /// second login, then organization relink. The relink runs after login
    /// has succeeded, so its failure never costs the session.
    async fn reprovision(
        &mut self,
        idp_token: &str,
        username: &str,
    ) -> Result<TokenPair, BootstrapError> {
        let ensured = self.ensure_user(idp_token, username).await?;
        debug!(
            username = %ensured.user.username,
            already_existed = ensured.already_existed,
            "backend user reprovisioned"
        );

        let tokens = self.delegated_login(idp_token, username).await?;
        self.mark_committed();

        match self.backend.ensure_organization(idp_token).await {
            Ok(EnsureOrgOutcome::Created) => info!("organization recreated during recovery"),
            Ok(EnsureOrgOutcome::AlreadyExists) => {
                debug!("organization still present during recovery");
            }
            Err(error) => {
                warn!(%error, "organization relink failed after successful login; continuing");
            }
        }

        Ok(tokens)
    }

    /// Idempotent user provisioning under cross-tab races. When creation
    /// loses the race, the loser converges on the winner's user via a
    /// bounded lookup retry instead of failing.
    pub async fn ensure_user(
        &self,
        bearer_token: &str,
        username: &str,
    ) -> Result<EnsureUserOutcome, BootstrapError> {
        if let WhoamiOutcome::User(user) = self.backend.whoami(bearer_token).await? {
            return Ok(EnsureUserOutcome {
                already_existed: true,
                user,
            });
        }

        let profile = self.identity.profile();
        let mut request = CreateUserRequest::delegated(username);
        request.email = profile.email.clone();
        request.display_name = profile.handle.clone();

        match self.backend.create_user(bearer_token, &request).await? {
            CreateUserOutcome::Created(user) => {
                info!(username, "backend user created");
                return Ok(EnsureUserOutcome {
                    already_existed: false,
                    user,
                });
            }
            CreateUserOutcome::UsernameUnavailable => {
                info!(username, "username claimed by a concurrent creator; retrying lookup");
            }
        }

        for attempt in 1..=self.retry.attempts {
            tokio::time::sleep(self.retry.pause).await;
            if let WhoamiOutcome::User(user) = self.backend.whoami(bearer_token).await? {
                return Ok(EnsureUserOutcome {
                    already_existed: true,
                    user,
                });
            }
            warn!(username, attempt, "user not visible yet after creation conflict");
        }

        Err(BootstrapError::ConflictUnresolved {
            attempts: self.retry.attempts,
        })
    }

    async fn delegated_login(
        &self,
        idp_token: &str,
        username: &str,
    ) -> Result<TokenPair, BootstrapError> {
        match self
            .backend
            .login(idp_token, &LoginRequest::delegated(username))
            .await?
        {
            LoginOutcome::Tokens(tokens) => Ok(tokens),
            LoginOutcome::Unauthorized => Err(BootstrapError::LoginUnauthorized),
        }
    }

    /// Persist tokens, mark the organization selected, record it cross-tab.
    /// Everything past the `mark_committed` line is post-login and therefore
    /// survivable.
    fn commit(
        &mut self,
        tokens: TokenPair,
        idp_token: String,
        org_id: &str,
    ) -> Result<(), BootstrapError> {
        self.mark_committed();
        self.session.apply_login(tokens, idp_token);
        self.tab.org_selected = true;
        self.org_store
            .persist_active_org(&ActiveOrgRecord::activated(org_id))
            .map_err(|error| BootstrapError::Store {
                message: error.to_string(),
            })
    }

    fn mark_committed(&mut self) {
        self.phase = match self.phase {
            BootstrapPhase::Recovering { .. } => BootstrapPhase::Recovering { committed: true },
            _ => BootstrapPhase::Bootstrapping { committed: true },
        };
    }

    fn committed(&self) -> bool {
        matches!(
            self.phase,
            BootstrapPhase::Bootstrapping { committed: true }
                | BootstrapPhase::Recovering { committed: true }
        )
    }

    /// Clear every piece of local and cross-tab state, then end the IdP
    /// session. Also the reset path for pre-commit bootstrap failure.
    pub async fn sign_out(&mut self) {
        if let Err(error) = self.org_store.clear_active_org() {
            warn!(%error, "failed to clear cross-tab organization record");
        }
        self.session.clear();
        self.tab.reset();
        self.auto_join_attempted = false;
        self.phase = BootstrapPhase::Idle;
        self.identity.sign_out().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_retry_policy_defaults_stay_bounded() {
        let policy = ConflictRetryPolicy::default();
        assert_eq!(policy.attempts, CONFLICT_RETRY_ATTEMPTS);
        assert_eq!(policy.pause, Duration::from_millis(CONFLICT_RETRY_PAUSE_MS));
        assert!(policy.attempts <= 3);
    }

    #[test]
    fn skip_reason_labels_are_stable() {
        assert_eq!(
            AutoJoinSkipReason::StoredOrgMismatch.as_str(),
            "stored_org_mismatch"
        );
        assert_eq!(AutoJoinSkipReason::NoStoredOrg.as_str(), "no_stored_org");
        assert_eq!(
            AutoJoinSkipReason::AlreadyAttempted.as_str(),
            "already_attempted"
        );
    }

    #[test]
    fn bootstrap_error_messages_keep_stable_codes() {
        assert_eq!(
            BootstrapError::IdentityTokenUnavailable.to_string(),
            "identity_token_unavailable"
        );
        assert_eq!(
            BootstrapError::ConflictUnresolved { attempts: 3 }.to_string(),
            "user_conflict_unresolved_after_3_lookups"
        );
    }
}
