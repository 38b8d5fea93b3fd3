use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;

/// Read-only view of the IdP user profile. Username derivation prefers the
/// handle, then the primary email, then the opaque IdP user id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityProfile {
    pub handle: Option<String>,
    pub email: Option<String>,
    pub user_id: String,
}

/// Read-only view of the organization the IdP session currently reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityOrg {
    pub id: String,
    pub loaded: bool,
}

/// Consumption contract for the external identity provider. Token issuance
/// and rotation live entirely on the IdP side; this subsystem only reads the
/// current token, the reported organization, and the profile, and asks the
/// IdP to end the session on unrecoverable bootstrap failure.
#[async_trait]
pub trait IdentitySession: Send + Sync {
    /// Fetch the freshest bearer token, or `None` when the session is gone.
    async fn get_token(&self) -> Option<String>;

    fn organization(&self) -> Option<IdentityOrg>;

    fn profile(&self) -> IdentityProfile;

    /// Delivers the latest token whenever it rotates; `None` on session end.
    fn subscribe(&self) -> watch::Receiver<Option<String>>;

    async fn sign_out(&self);
}

#[must_use]
pub fn derive_username(profile: &IdentityProfile) -> String {
    if let Some(handle) = non_empty(profile.handle.as_deref()) {
        return handle;
    }
    if let Some(email) = non_empty(profile.email.as_deref()) {
        return email;
    }
    profile.user_id.trim().to_string()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// In-memory [`IdentitySession`] for tests and native hosts that manage the
/// IdP handshake elsewhere. Rotation is driven through [`StaticIdentitySession::rotate_token`].
pub struct StaticIdentitySession {
    profile: IdentityProfile,
    organization: Mutex<Option<IdentityOrg>>,
    token_tx: watch::Sender<Option<String>>,
}

impl StaticIdentitySession {
    #[must_use]
    pub fn new(profile: IdentityProfile, token: impl Into<String>) -> Self {
        let (token_tx, _) = watch::channel(Some(token.into()));
        Self {
            profile,
            organization: Mutex::new(None),
            token_tx,
        }
    }

    pub fn set_organization(&self, organization: Option<IdentityOrg>) {
        if let Ok(mut slot) = self.organization.lock() {
            *slot = organization;
        }
    }

    /// Replace the current token, waking any rotation subscriber.
    pub fn rotate_token(&self, token: impl Into<String>) {
        let _ = self.token_tx.send(Some(token.into()));
    }

    /// Drop the token entirely, signalling session end to subscribers.
    pub fn end_session(&self) {
        let _ = self.token_tx.send(None);
    }
}

#[async_trait]
impl IdentitySession for StaticIdentitySession {
    async fn get_token(&self) -> Option<String> {
        self.token_tx.borrow().clone()
    }

    fn organization(&self) -> Option<IdentityOrg> {
        self.organization.lock().ok().and_then(|slot| slot.clone())
    }

    fn profile(&self) -> IdentityProfile {
        self.profile.clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.token_tx.subscribe()
    }

    async fn sign_out(&self) {
        self.end_session();
    }
}
