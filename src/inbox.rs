//! Admin side of support chat: the list the admin panel shows and the
//! actions it takes on a conversation.

use crate::api::models::{ADMIN_SENDER_ID, ConversationStatus, ConversationSummary, Identity, SummaryUpdate};
use crate::error::InboxError;
use crate::store::ChatStore;
use crate::utils::is_blank;
use std::sync::Arc;

pub struct SupportInbox {
    store: Arc<dyn ChatStore>,
    admin: Identity,
}

impl SupportInbox {
    pub fn new(store: Arc<dyn ChatStore>, admin: Identity) -> Result<Self, InboxError> {
        if !admin.is_admin {
            return Err(InboxError::NotAdmin);
        }
        Ok(Self { store, admin })
    }

    pub fn admin(&self) -> &Identity {
        &self.admin
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, InboxError> {
        Ok(self.store.list_conversations().await?)
    }

    pub async fn unread_count(&self) -> Result<usize, InboxError> {
        let all = self.conversations().await?;
        Ok(all.iter().filter(|c| c.unread_by_admin).count())
    }

    /// Replies as the support team and marks the thread read.
    pub async fn reply(&self, conversation_id: &str, text: &str) -> Result<String, InboxError> {
        if is_blank(text) {
            return Err(InboxError::EmptyMessage);
        }
        let id = self
            .store
            .append_message(conversation_id, text, ADMIN_SENDER_ID)
            .await?;
        let update = SummaryUpdate {
            last_message: Some(text.to_string()),
            unread_by_admin: Some(false),
            ..SummaryUpdate::default()
        };
        self.store.upsert_conversation_summary(conversation_id, &update).await?;
        log::info!("{} replied in {conversation_id}", self.admin.id);
        Ok(id)
    }

    pub async fn mark_read(&self, conversation_id: &str) -> Result<(), InboxError> {
        let update = SummaryUpdate {
            unread_by_admin: Some(false),
            ..SummaryUpdate::default()
        };
        Ok(self.store.upsert_conversation_summary(conversation_id, &update).await?)
    }

    pub async fn resolve(&self, summary: &ConversationSummary) -> Result<(), InboxError> {
        let next = ConversationStatus::Resolved;
        if !summary.status.can_transition_to(next) {
            return Err(InboxError::InvalidTransition {
                id: summary.id.clone(),
                from: summary.status.to_string(),
                to: next.to_string(),
            });
        }
        let update = SummaryUpdate {
            status: Some(next),
            ..SummaryUpdate::default()
        };
        self.store.upsert_conversation_summary(&summary.id, &update).await?;
        log::info!("{} resolved {}", self.admin.id, summary.id);
        Ok(())
    }
}
