pub mod exchange;
pub mod models;
pub mod sessions;
pub mod store;

pub use exchange::{AuthArtifact, CredentialExchanger, CredentialVerifier};
pub use models::{AuthError, GoogleClaims, Identity, IssuedSession, PendingAuthGrant, Session};
pub use sessions::{SessionTokenManager, SessionValidator};
pub use store::{GrantStore, IdentityStore, SessionStore};
