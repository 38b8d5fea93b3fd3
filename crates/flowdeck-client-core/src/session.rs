use crate::backend::TokenPair;

/// Tab-local holder of the established backend session. Superseded in full
/// by every successful login; only the access credential changes on IdP
/// token rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    tokens: Option<TokenPair>,
    last_idp_token: Option<String>,
}

impl SessionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed login exchange and the IdP token it was minted
    /// from.
    pub fn apply_login(&mut self, tokens: TokenPair, idp_token: impl Into<String>) {
        self.tokens = Some(tokens);
        self.last_idp_token = Some(idp_token.into());
    }

    /// Swap in a rotated access credential, keeping the refresh token. No-op
    /// when no session has been established yet.
    pub fn refresh_access_token(&mut self, idp_token: impl Into<String>) {
        let idp_token = idp_token.into();
        if let Some(tokens) = self.tokens.as_mut() {
            tokens.access_token = idp_token.clone();
        }
        self.last_idp_token = Some(idp_token);
    }

    /// Remember an IdP token observed before bootstrap completed. Nothing to
    /// synchronize yet; kept only for later comparison.
    pub fn remember_idp_token(&mut self, idp_token: impl Into<String>) {
        self.last_idp_token = Some(idp_token.into());
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|tokens| tokens.access_token.as_str())
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|tokens| tokens.refresh_token.as_str())
    }

    #[must_use]
    pub fn last_idp_token(&self) -> Option<&str> {
        self.last_idp_token.as_deref()
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.tokens.is_some()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
