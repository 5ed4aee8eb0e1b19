//! Per-user support conversation: live subscription, optimistic send and
//! reconciliation of server snapshots.

use crate::api::events::{MessageSnapshot, SnapshotResult, Subscription};
use crate::api::models::{ConversationSummary, Identity, Message, SummaryUpdate};
use crate::error::{ReadError, SubscriptionError, WriteError};
use crate::store::ChatStore;
use crate::utils::is_blank;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Unauthenticated,
    Idle,
    Sending,
}

/// A message shown before (or while) the store confirms it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Optimistic {
    ticket: u64,
    text: String,
    sender_id: String,
    confirmed_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub id: Option<String>,
    pub text: String,
    pub sender_id: String,
    pub pending: bool,
}

impl From<&Message> for TimelineEntry {
    fn from(m: &Message) -> Self {
        Self {
            id: Some(m.id.clone()),
            text: m.text.clone(),
            sender_id: m.sender_id.clone(),
            pending: false,
        }
    }
}

/// Owned write half of a send, so it can run on another task while the
/// machine keeps applying snapshots.
pub struct PendingSend {
    ticket: u64,
    store: Arc<dyn ChatStore>,
    conversation_id: String,
    sender_id: String,
    user_email: Option<String>,
    text: String,
}

impl PendingSend {
    /// Hands the result back to [`ConversationMachine::finish_send`].
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The summary is only written once the message itself has landed.
    pub async fn commit(self) -> Result<String, WriteError> {
        let id = self
            .store
            .append_message(&self.conversation_id, &self.text, &self.sender_id)
            .await?;
        let update = SummaryUpdate::user_sent(&self.text, self.user_email.as_deref());
        self.store
            .upsert_conversation_summary(&self.conversation_id, &update)
            .await?;
        log::info!("support message {id} sent for {}", self.conversation_id);
        Ok(id)
    }
}

pub struct ConversationMachine {
    store: Arc<dyn ChatStore>,
    identity: Option<Identity>,
    state: ChatState,
    subscription: Option<Subscription>,
    messages: Vec<Message>,
    optimistic: Option<Optimistic>,
    next_ticket: u64,
    summary: Option<ConversationSummary>,
    feed_error: Option<SubscriptionError>,
}

impl ConversationMachine {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            identity: None,
            state: ChatState::Unauthenticated,
            subscription: None,
            messages: Vec::new(),
            optimistic: None,
            next_ticket: 0,
            summary: None,
            feed_error: None,
        }
    }

    pub fn state(&self) -> ChatState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Local view of the conversation document; `None` while logged out.
    /// Starts as an unwritten summary on open and follows this client's own
    /// sends. [`Self::refresh_summary`] reloads it from the store.
    pub fn summary(&self) -> Option<&ConversationSummary> {
        self.summary.as_ref()
    }

    pub fn feed_error(&self) -> Option<&SubscriptionError> {
        self.feed_error.as_ref()
    }

    /// Returns true when a new subscription was established.
    pub fn open(&mut self, identity: Option<Identity>) -> bool {
        let Some(identity) = identity else {
            self.close();
            self.identity = None;
            self.summary = None;
            self.messages.clear();
            self.optimistic = None;
            self.state = ChatState::Unauthenticated;
            return false;
        };

        let same_user = self.identity.as_ref().is_some_and(|cur| cur.id == identity.id);
        if same_user && self.subscription.is_some() {
            return false;
        }
        self.close();
        if !same_user {
            self.messages.clear();
            self.optimistic = None;
            self.summary = Some(ConversationSummary::unwritten(
                &identity.id,
                identity.email.as_deref(),
            ));
            self.state = ChatState::Idle;
        } else if self.state == ChatState::Unauthenticated {
            self.state = ChatState::Idle;
        }
        self.subscription = Some(self.store.subscribe(&identity.id));
        self.identity = Some(identity);
        true
    }

    /// Tears down the live feed. Nothing from it is applied afterwards.
    pub fn close(&mut self) {
        if let Some(sub) = self.subscription.take() {
            sub.close();
        }
    }

    pub fn can_send(&self, text: &str) -> bool {
        self.state == ChatState::Idle && self.identity.is_some() && !is_blank(text)
    }

    /// Enters `Sending` and records the optimistic entry. `None` means the
    /// send is a no-op.
    pub fn begin_send(&mut self, text: &str) -> Option<PendingSend> {
        if !self.can_send(text) {
            return None;
        }
        let identity = self.identity.as_ref()?;
        self.next_ticket += 1;
        let pending = PendingSend {
            ticket: self.next_ticket,
            store: self.store.clone(),
            conversation_id: identity.id.clone(),
            sender_id: identity.id.clone(),
            user_email: identity.email.clone(),
            text: text.to_string(),
        };
        self.optimistic = Some(Optimistic {
            ticket: pending.ticket,
            text: pending.text.clone(),
            sender_id: pending.sender_id.clone(),
            confirmed_id: None,
        });
        self.state = ChatState::Sending;
        Some(pending)
    }

    /// Settles the send identified by `ticket`. `None` when that send no
    /// longer belongs to the open conversation (the user switched or logged
    /// out meanwhile); its result is then dropped without touching state.
    pub fn finish_send(
        &mut self,
        ticket: u64,
        result: Result<String, WriteError>,
    ) -> Option<Result<String, WriteError>> {
        if self.optimistic.as_ref().map(|o| o.ticket) != Some(ticket) {
            log::debug!("dropping result of stale send {ticket}");
            return None;
        }
        if self.state == ChatState::Sending {
            self.state = ChatState::Idle;
        }
        let mut entry = self.optimistic.take()?;
        match result {
            Ok(id) => {
                if let Some(summary) = self.summary.as_mut() {
                    SummaryUpdate::user_sent(&entry.text, None).apply_to(summary);
                }
                if !self.messages.iter().any(|m| m.id == id) {
                    entry.confirmed_id = Some(id.clone());
                    self.optimistic = Some(entry);
                }
                Some(Ok(id))
            }
            Err(e) => {
                log::warn!("support message not sent: {e}");
                Some(Err(e))
            }
        }
    }

    /// `Ok(None)` when the text was blank, nobody is signed in, or a send is
    /// already in flight.
    pub async fn send(&mut self, text: &str) -> Result<Option<String>, WriteError> {
        let Some(pending) = self.begin_send(text) else {
            return Ok(None);
        };
        let ticket = pending.ticket();
        let result = pending.commit().await;
        self.finish_send(ticket, result).transpose()
    }

    /// Reloads the summary of the open conversation from the store. A
    /// conversation that was never written keeps its unwritten summary.
    pub async fn refresh_summary(&mut self) -> Result<(), ReadError> {
        let Some(id) = self.identity.as_ref().map(|i| i.id.clone()) else {
            return Ok(());
        };
        if let Some(stored) = self.store.conversation_summary(&id).await? {
            self.summary = Some(stored);
        }
        Ok(())
    }

    pub fn apply_snapshot(&mut self, snapshot: MessageSnapshot) {
        let current = self.identity.as_ref().map(|i| i.id.as_str());
        if current != Some(snapshot.conversation_id.as_str()) {
            log::debug!("dropping snapshot for stale conversation {}", snapshot.conversation_id);
            return;
        }
        self.feed_error = None;
        self.messages = snapshot.messages;
        let landed = self
            .optimistic
            .as_ref()
            .and_then(|o| o.confirmed_id.as_ref())
            .is_some_and(|id| self.messages.iter().any(|m| &m.id == id));
        if landed {
            self.optimistic = None;
        }
    }

    fn apply(&mut self, item: SnapshotResult) {
        match item {
            Ok(snapshot) => self.apply_snapshot(snapshot),
            Err(e) => {
                log::warn!("support chat feed: {e}");
                self.feed_error = Some(e);
            }
        }
    }

    /// Applies every snapshot already delivered. Returns how many were seen.
    pub fn pump(&mut self) -> usize {
        let mut seen = 0;
        while let Some(item) = self.subscription.as_mut().and_then(Subscription::try_next) {
            self.apply(item);
            seen += 1;
        }
        seen
    }

    /// Waits for the next feed item. `None` once no feed is open.
    pub async fn next_update(&mut self) -> Option<()> {
        let item = self.subscription.as_mut()?.next().await?;
        self.apply(item);
        Some(())
    }

    /// Confirmed messages, then the optimistic entry until a snapshot
    /// carries it.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let mut entries: Vec<TimelineEntry> = self.messages.iter().map(TimelineEntry::from).collect();
        if let Some(o) = &self.optimistic {
            entries.push(TimelineEntry {
                id: o.confirmed_id.clone(),
                text: o.text.clone(),
                sender_id: o.sender_id.clone(),
                pending: true,
            });
        }
        entries
    }
}

impl Drop for ConversationMachine {
    fn drop(&mut self) {
        self.close();
    }
}
