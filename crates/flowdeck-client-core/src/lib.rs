//! Client core for the flowdeck identity-to-backend-session bootstrap.
//!
//! Takes a session issued by an external identity provider and turns it into
//! an organization-scoped backend session: idempotent user/organization
//! provisioning under concurrent tabs, strict step ordering, self-healing
//! recovery when the backend loses session state the IdP still considers
//! valid, and credential refresh on IdP token rotation.

pub mod backend;
pub mod bootstrap;
pub mod identity;
pub mod manager;
pub mod rotation;
pub mod session;
pub mod store;

pub use backend::{
    BackendError, BackendTransport, BackendUser, CreateUserOutcome, CreateUserRequest,
    DELEGATED_LOGIN_SECRET, EnsureOrgOutcome, LoginOutcome, LoginRequest, TokenPair, WhoamiOutcome,
};
pub use bootstrap::{
    AuthBootstrapCoordinator, AutoJoinOutcome, AutoJoinSkipReason, BootstrapError,
    BootstrapOutcome, BootstrapPhase, ConflictRetryPolicy, EnsureUserOutcome,
};
pub use identity::{
    IdentityOrg, IdentityProfile, IdentitySession, StaticIdentitySession, derive_username,
};
pub use manager::SessionManager;
pub use rotation::{RotationOutcome, TokenRotationListener};
pub use session::SessionContext;
pub use store::{ActiveOrgRecord, ActiveOrgStore, MemoryActiveOrgStore, TabLocalState};
