pub mod models;
pub mod registry;
pub mod router;

pub use models::{
    ToolCallRequest, ToolCallResult, ToolDescriptor, ToolFailure, ToolTransportError,
};
pub use registry::ToolRegistry;
pub use router::{
    BrokerError, CredentialBroker, RouterConfig, ToolInvoker, ToolRouter, ToolTransport,
};
