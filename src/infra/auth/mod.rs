pub mod google_verifier;
pub mod memory_store;
pub mod sqlite_store;

pub use google_verifier::GoogleIdTokenVerifier;
pub use memory_store::{InMemoryGrantStore, InMemoryIdentityStore, InMemorySessionStore};
pub use sqlite_store::SqliteAuthStore;
