//! Persistence layer for triage
//!
//! This crate provides a SQLite implementation of every collaborator the
//! router depends on: conversations and messages, installed agents,
//! assignments, conversation turns, metrics and the key-value config store.

pub mod sqlite;

// Re-export main types
pub use sqlite::SqliteStore;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Arc;
    use triage_core::routing::Router;
    use triage_core::store::{ConversationStore, Stores};
    use triage_core::types::{ConversationStatus, MessageDirection};
    use triage_core::RoutingConfig;

    #[tokio::test]
    async fn test_router_over_sqlite_without_agents() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let store = Arc::new(SqliteStore::open(dir.path().join("triage.db"))?);
        let conv = store.create_conversation(1, ConversationStatus::Pending).await?;
        store
            .append_message(conv.id, MessageDirection::Incoming, "My invoice shows a double charge")
            .await?;

        let router = Router::new(Stores::from_shared(store.clone()), &RoutingConfig::default());
        let result = router.route(conv.id, false).await?;
        assert!(!result.routed);
        assert!(result.agent.is_none());
        assert!(!result.fallback.is_empty());
        Ok(())
    }
}
