//! per-session display history.
//!
//! append-only: each exchange adds exactly one turn, failures included.
//! nothing here is ever sent back to the model.

use bevy::prelude::*;

use crate::transport::{ResponseResult, Transport};

/// prefix that marks bot replies for the display layer.
pub const BOT_MARKER: &str = "🤖";
/// stands in for the user text on failed turns (see `ErrorAttribution::Label`).
pub const ERROR_LABEL: &str = "Error:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub user: String,
    pub reply: String,
}

impl ConversationTurn {
    pub fn new(user: impl Into<String>, reply: impl Into<String>) -> Self {
        Self { user: user.into(), reply: reply.into() }
    }
}

/// what occupies the user slot of a failed turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorAttribution {
    /// the literal `"Error:"`; the user's text is not shown for that turn.
    #[default]
    Label,
    /// keep the user's text; the reply slot still carries the error.
    UserText,
}

#[derive(Component, Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    turns: Vec<ConversationTurn>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn append_turn(&mut self, user_text: &str, result: &ResponseResult) -> &ConversationTurn {
        self.append_turn_with(user_text, result, ErrorAttribution::Label)
    }

    pub fn append_turn_with(
        &mut self,
        user_text: &str,
        result: &ResponseResult,
        attribution: ErrorAttribution,
    ) -> &ConversationTurn {
        let turn = match (result, result.error_description()) {
            (ResponseResult::Success(text), _) => {
                ConversationTurn::new(user_text, format!("{BOT_MARKER} {text}"))
            }
            (_, description) => {
                let user = match attribution {
                    ErrorAttribution::Label => ERROR_LABEL,
                    ErrorAttribution::UserText => user_text,
                };
                ConversationTurn::new(user, description.unwrap_or_default())
            }
        };
        self.turns.push(turn);
        &self.turns[self.turns.len() - 1]
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a ConversationTurn;
    type IntoIter = std::slice::Iter<'a, ConversationTurn>;

    fn into_iter(self) -> Self::IntoIter {
        self.turns.iter()
    }
}

/// one full exchange: send `user_text`, fold the outcome into `history`.
pub async fn submit(transport: &dyn Transport, mut history: History, user_text: &str) -> History {
    let result = transport.send(user_text).await;
    if let Some(err) = result.error_description() {
        error!(target: "bevy_gemini_chat", "exchange failed: {err}");
    }
    history.append_turn(user_text, &result);
    history
}

/// `submit`, plus the cleared input box the ui should show next.
pub async fn handle_user_input(
    transport: &dyn Transport,
    history: History,
    user_message: &str,
) -> (History, String) {
    (submit(transport, history, user_message).await, String::new())
}
