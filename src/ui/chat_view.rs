use std::fmt::Write as _;

pub const TITLE: &str = "Support Chat";
pub const WELCOME: &str = "Welcome to APNA ADDA!";
pub const HOW_CAN_WE_HELP: &str = "How can we help you today?";
pub const AGENT_HINT: &str = "Our agent will shortly assist you...";
pub const LOGIN_PROMPT: &str = "Please log in to start a chat with our support team.";
pub const PLACEHOLDER: &str = "Type your message...";
pub const SEND_ERROR: &str = "Sorry, your message could not be sent. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bubble {
    pub text: String,
    pub side: Side,
    pub pending: bool,
}

impl Bubble {
    pub fn system(text: &str) -> Self {
        Self {
            text: text.to_string(),
            side: Side::Incoming,
            pending: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composer {
    pub text: String,
    pub placeholder: &'static str,
    pub input_enabled: bool,
    pub button_label: &'static str,
    pub button_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatBody {
    LoginPrompt,
    Thread { bubbles: Vec<Bubble>, composer: Composer },
}

/// Everything a front-end needs to draw the open widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatView {
    pub title: &'static str,
    pub body: ChatBody,
    pub error: Option<String>,
}

impl ChatView {
    pub fn bubbles(&self) -> &[Bubble] {
        match &self.body {
            ChatBody::Thread { bubbles, .. } => bubbles,
            ChatBody::LoginPrompt => &[],
        }
    }

    pub fn composer(&self) -> Option<&Composer> {
        match &self.body {
            ChatBody::Thread { composer, .. } => Some(composer),
            ChatBody::LoginPrompt => None,
        }
    }

    /// Plain-text rendering for terminals.
    pub fn to_plain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "== {} ==", self.title);
        match &self.body {
            ChatBody::LoginPrompt => {
                let _ = writeln!(out, "{LOGIN_PROMPT}");
            }
            ChatBody::Thread { bubbles, composer } => {
                for b in bubbles {
                    let marker = match (b.side, b.pending) {
                        (Side::Outgoing, true) => ">> (sending)",
                        (Side::Outgoing, false) => ">>",
                        (Side::Incoming, _) => "<<",
                    };
                    let _ = writeln!(out, "{marker} {}", b.text);
                }
                let _ = writeln!(out, "[{}]", composer.button_label);
            }
        }
        if let Some(err) = &self.error {
            let _ = writeln!(out, "!! {err}");
        }
        out
    }
}
