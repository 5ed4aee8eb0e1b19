//! Backend contract shared by the Firestore client and the local SQLite store.

use crate::api::events::Subscription;
use crate::api::models::{ConversationSummary, SummaryUpdate};
use crate::error::{ReadError, ResolutionError, WriteError};
use async_trait::async_trait;

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Replays the full ordered history, then emits a new snapshot whenever
    /// the message set changes.
    fn subscribe(&self, conversation_id: &str) -> Subscription;

    /// Returns the store-assigned message id. The timestamp comes from the
    /// store's clock.
    async fn append_message(
        &self,
        conversation_id: &str,
        text: &str,
        sender_id: &str,
    ) -> Result<String, WriteError>;

    async fn upsert_conversation_summary(
        &self,
        conversation_id: &str,
        update: &SummaryUpdate,
    ) -> Result<(), WriteError>;

    /// `Ok(None)` until the first summary write for this conversation.
    async fn conversation_summary(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationSummary>, ReadError>;

    /// Most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ReadError>;
}

#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// `Ok(None)` when the user has no role record.
    async fn role_of(&self, uid: &str) -> Result<Option<String>, ResolutionError>;
}
