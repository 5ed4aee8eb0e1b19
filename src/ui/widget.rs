use crate::api::models::Identity;
use crate::conversation::{ChatState, ConversationMachine};
use crate::error::WriteError;
use crate::store::ChatStore;
use crate::ui::chat_view::{
    AGENT_HINT, Bubble, ChatBody, ChatView, Composer, HOW_CAN_WE_HELP, PLACEHOLDER, SEND_ERROR, Side, TITLE,
    WELCOME,
};
use crate::utils::is_blank;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long the "agent will assist you" hint stays up after a send.
pub const HINT_WINDOW: Duration = Duration::from_secs(4);

/// Floating support widget: open/closed toggle, compose buffer and the
/// cosmetic bits around the conversation.
pub struct SupportWidget {
    machine: ConversationMachine,
    identity: Option<Identity>,
    is_open: bool,
    compose: String,
    pending: Option<(u64, JoinHandle<Result<String, WriteError>>)>,
    hint_until: Option<Instant>,
    error: Option<String>,
    rendered: (usize, bool),
    scroll_requested: bool,
}

impl SupportWidget {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            machine: ConversationMachine::new(store),
            identity: None,
            is_open: false,
            compose: String::new(),
            pending: None,
            hint_until: None,
            error: None,
            rendered: (0, false),
            scroll_requested: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn compose(&self) -> &str {
        &self.compose
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn conversation(&self) -> &ConversationMachine {
        &self.machine
    }

    pub fn is_sending(&self) -> bool {
        self.machine.state() == ChatState::Sending
    }

    /// The feed only runs while the widget is open.
    pub fn toggle(&mut self) {
        self.is_open = !self.is_open;
        if self.is_open {
            self.machine.open(self.identity.clone());
        } else {
            self.machine.close();
        }
        self.refresh_scroll();
    }

    /// Session changed upstream.
    pub fn set_identity(&mut self, identity: Option<Identity>) {
        self.identity = identity;
        if self.is_open || self.identity.is_none() {
            self.machine.open(self.identity.clone());
        }
        self.refresh_scroll();
    }

    /// Ignored while a send is in flight; the input is disabled then.
    pub fn set_compose(&mut self, text: &str) {
        if !self.is_sending() {
            self.compose = text.to_string();
        }
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    pub fn can_send(&self) -> bool {
        self.is_open && self.pending.is_none() && self.machine.can_send(&self.compose)
    }

    /// Starts a send in the background. Returns false when nothing was sent.
    pub fn submit(&mut self) -> bool {
        if !self.can_send() {
            return false;
        }
        let Some(pending) = self.machine.begin_send(&self.compose) else {
            return false;
        };
        self.error = None;
        let ticket = pending.ticket();
        self.pending = Some((ticket, tokio::spawn(pending.commit())));
        self.refresh_scroll();
        true
    }

    /// Non-blocking housekeeping for a UI tick.
    pub async fn poll(&mut self) {
        if self.pending.as_ref().is_some_and(|(_, handle)| handle.is_finished()) {
            self.finish_pending().await;
        }
        self.machine.pump();
        self.expire_hint();
        self.refresh_scroll();
    }

    /// Waits for an in-flight send, then catches up like [`Self::poll`].
    pub async fn flush(&mut self) {
        if self.pending.is_some() {
            self.finish_pending().await;
        }
        self.poll().await;
    }

    /// Reloads the conversation status shown for the signed-in user.
    pub async fn refresh_summary(&mut self) {
        if let Err(e) = self.machine.refresh_summary().await {
            log::warn!("could not load support conversation: {e}");
        }
    }

    /// Waits for the next live snapshot. False when the feed is closed.
    pub async fn wait_for_update(&mut self) -> bool {
        let updated = self.machine.next_update().await.is_some();
        self.refresh_scroll();
        updated
    }

    pub fn hint_deadline(&self) -> Option<Instant> {
        self.hint_until
    }

    pub fn hint_visible(&self) -> bool {
        self.hint_until.is_some_and(|until| Instant::now() < until)
    }

    /// True once per change of message count or hint visibility.
    pub fn take_scroll_request(&mut self) -> bool {
        std::mem::take(&mut self.scroll_requested)
    }

    async fn finish_pending(&mut self) {
        let Some((ticket, handle)) = self.pending.take() else {
            return;
        };
        let result = handle
            .await
            .unwrap_or_else(|e| Err(WriteError::Unreachable(format!("send task failed: {e}"))));
        // A send started for a previous user must not touch the buffer,
        // hint or error shown to the current one.
        match self.machine.finish_send(ticket, result) {
            Some(Ok(_)) => {
                self.compose.clear();
                self.hint_until = Some(Instant::now() + HINT_WINDOW);
            }
            Some(Err(_)) => self.error = Some(SEND_ERROR.to_string()),
            None => {}
        }
    }

    fn expire_hint(&mut self) {
        if self.hint_until.is_some_and(|until| Instant::now() >= until) {
            self.hint_until = None;
        }
    }

    fn refresh_scroll(&mut self) {
        let key = (self.machine.timeline().len(), self.hint_visible());
        if key != self.rendered {
            self.rendered = key;
            self.scroll_requested = true;
        }
    }

    /// `None` while the widget is collapsed.
    pub fn render(&self) -> Option<ChatView> {
        if !self.is_open {
            return None;
        }
        let error = self
            .error
            .clone()
            .or_else(|| self.machine.feed_error().map(|e| e.to_string()));
        let Some(identity) = self.machine.identity() else {
            return Some(ChatView {
                title: TITLE,
                body: ChatBody::LoginPrompt,
                error,
            });
        };

        let timeline = self.machine.timeline();
        let mut bubbles = vec![Bubble::system(WELCOME)];
        if timeline.is_empty() {
            bubbles.push(Bubble::system(HOW_CAN_WE_HELP));
        }
        bubbles.extend(timeline.into_iter().map(|entry| Bubble {
            side: if entry.sender_id == identity.id {
                Side::Outgoing
            } else {
                Side::Incoming
            },
            text: entry.text,
            pending: entry.pending,
        }));
        if self.hint_visible() {
            bubbles.push(Bubble::system(AGENT_HINT));
        }

        let sending = self.is_sending();
        let composer = Composer {
            text: self.compose.clone(),
            placeholder: PLACEHOLDER,
            input_enabled: !sending,
            button_label: if sending { "Sending..." } else { "Send" },
            button_enabled: !sending && !is_blank(&self.compose),
        };
        Some(ChatView {
            title: TITLE,
            body: ChatBody::Thread { bubbles, composer },
            error,
        })
    }
}
