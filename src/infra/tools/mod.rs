pub mod google_credentials;
pub mod workspace_client;

pub use google_credentials::GoogleCredentialBroker;
pub use workspace_client::WorkspaceToolClient;
