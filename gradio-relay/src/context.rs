//! Conversation context fed to the text-generation backend.
//!
//! A context is the ordered list of messages exchanged in one conversation.
//! It renders into a flat transcript prompt using the configured speaker
//! tokens, and keeps that prompt inside a word budget by forgetting the oldest
//! messages first.

mod registry;

pub use registry::{ContextRegistry, SharedContext};

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::config::TextGenConfig;

/// Who wrote a context message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    pub display_name: String,
}

/// One message of a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMessage {
    pub author: Author,
    pub text: String,
}

impl ContextMessage {
    /// A message from a chat participant
    pub fn from_user(
        id: impl Into<String>,
        display_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            author: Author {
                id: id.into(),
                display_name: display_name.into(),
            },
            text: text.into(),
        }
    }

    /// A message produced by the model; the bot is identified by its speaker token
    pub fn from_bot(bot_token: &str, text: impl Into<String>) -> Self {
        Self {
            author: Author {
                id: bot_token.to_string(),
                display_name: bot_token.to_string(),
            },
            text: text.into(),
        }
    }

    pub fn is_from_bot(&self, bot_token: &str) -> bool {
        self.author.id == bot_token
    }
}

/// Prompt rendering settings shared by every context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSettings {
    pub preamble: String,
    pub bot_token: String,
    pub human_token: String,
    pub maximum_prompt_tokens: usize,
}

impl From<&TextGenConfig> for PromptSettings {
    fn from(config: &TextGenConfig) -> Self {
        Self {
            preamble: config.preamble.clone(),
            bot_token: config.bot_token.clone(),
            human_token: config.human_token.clone(),
            maximum_prompt_tokens: config.maximum_prompt_tokens,
        }
    }
}

/// The message buffer of one conversation
#[derive(Debug, Clone)]
pub struct ChatContext {
    messages: VecDeque<ContextMessage>,
    settings: Arc<PromptSettings>,
}

impl ChatContext {
    pub fn new(settings: Arc<PromptSettings>) -> Self {
        Self {
            messages: VecDeque::new(),
            settings,
        }
    }

    /// Append a message, then drop old messages until the prompt fits
    pub fn add_message(&mut self, message: ContextMessage) {
        self.messages.push_back(message);
        self.enforce_size();
    }

    /// Drop the oldest messages while the rendered prompt is over budget
    pub fn enforce_size(&mut self) {
        let limit = self.settings.maximum_prompt_tokens;
        let mut dropped = 0;

        while !self.messages.is_empty() && self.token_count() > limit {
            self.messages.pop_front();
            dropped += 1;
        }

        if dropped > 0 {
            debug!(
                dropped,
                remaining = self.messages.len(),
                limit,
                "Truncated conversation context"
            );
        }
    }

    /// Render the conversation as a transcript ending in a bare bot token
    pub fn render_prompt(&self) -> String {
        let settings = &self.settings;
        let mut prompt = settings.preamble.clone();

        for message in &self.messages {
            let token = if message.is_from_bot(&settings.bot_token) {
                &settings.bot_token
            } else {
                &settings.human_token
            };
            prompt.push('\n');
            prompt.push_str(token);
            prompt.push(' ');
            prompt.push_str(&message.text);
        }

        // Ask the model for its next turn
        prompt.push('\n');
        prompt.push_str(&settings.bot_token);
        prompt
    }

    /// Approximate token count: whitespace-delimited words of the rendered prompt.
    /// The backend tokenizer is not available here.
    pub fn token_count(&self) -> usize {
        self.render_prompt().split_whitespace().count()
    }

    #[allow(dead_code)] // Useful for monitoring/debugging
    pub fn messages(&self) -> impl Iterator<Item = &ContextMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
