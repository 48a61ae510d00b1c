// Registry of remote tools, populated from the tool endpoint's capability
// list at startup and refreshed periodically in the background.
//
// Reads are snapshot-based: the current descriptor list lives behind one
// atomic Arc swap, so a reader sees either the old or the new list, never a
// partial one, and refreshes never block lookups.

use std::sync::{Arc, RwLock};

use super::models::{ToolDescriptor, ToolTransportError};
use super::router::ToolTransport;

pub struct ToolRegistry {
    snapshot: RwLock<Arc<Vec<ToolDescriptor>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Installs a new descriptor list, replacing the previous snapshot.
    pub fn install(&self, tools: Vec<ToolDescriptor>) {
        let mut guard = self.snapshot.write().expect("registry lock poisoned");
        *guard = Arc::new(tools);
    }

    /// Fetches the capability list from the endpoint and swaps it in.
    /// Returns the number of tools now registered.
    pub async fn refresh<T: ToolTransport + ?Sized>(
        &self,
        transport: &T,
    ) -> Result<usize, ToolTransportError> {
        let tools = transport.list_tools().await?;
        let count = tools.len();
        self.install(tools);
        tracing::debug!(count, "tool registry refreshed");
        Ok(count)
    }

    /// The current snapshot. Cheap to clone, safe to hold across awaits.
    pub fn descriptors(&self) -> Arc<Vec<ToolDescriptor>> {
        Arc::clone(&self.snapshot.read().expect("registry lock poisoned"))
    }

    pub fn lookup(&self, name: &str) -> Option<ToolDescriptor> {
        self.descriptors().iter().find(|t| t.name == name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors().is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: String::new(),
            input_schema: Value::Null,
            parallel_safe: false,
        }
    }

    #[test]
    fn lookup_finds_installed_tools() {
        let registry = ToolRegistry::new();
        assert!(registry.lookup("send_email").is_none());

        registry.install(vec![descriptor("send_email"), descriptor("list_events")]);
        assert!(registry.lookup("send_email").is_some());
        assert!(registry.lookup("delete_everything").is_none());
    }

    #[test]
    fn old_snapshots_survive_a_swap() {
        let registry = ToolRegistry::new();
        registry.install(vec![descriptor("a")]);

        let before = registry.descriptors();
        registry.install(vec![descriptor("b"), descriptor("c")]);

        // A reader holding the old snapshot still sees a consistent list.
        assert_eq!(before.len(), 1);
        assert_eq!(registry.descriptors().len(), 2);
    }
}
