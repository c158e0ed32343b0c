//! Process-wide store of conversation contexts.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::debug;

use super::{ChatContext, PromptSettings};

/// A context shared between the registry and in-flight requests
pub type SharedContext = Arc<Mutex<ChatContext>>;

/// Maps conversation ids to their contexts, creating them on first access
pub struct ContextRegistry {
    contexts: DashMap<String, SharedContext>,
    settings: Arc<PromptSettings>,
}

impl ContextRegistry {
    pub fn new(settings: PromptSettings) -> Self {
        Self {
            contexts: DashMap::new(),
            settings: Arc::new(settings),
        }
    }

    /// Get the context for a conversation, creating an empty one if needed.
    ///
    /// Concurrent first lookups of the same id observe a single instance.
    pub fn get_context(&self, conversation_id: &str) -> SharedContext {
        self.contexts
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                debug!(conversation_id = %conversation_id, "Creating conversation context");
                Arc::new(Mutex::new(ChatContext::new(self.settings.clone())))
            })
            .clone()
    }

    /// Forget every message of a conversation; the entry itself stays
    pub fn reset(&self, conversation_id: &str) {
        let context = self.get_context(conversation_id);
        context.lock().unwrap().clear();
        debug!(conversation_id = %conversation_id, "Reset conversation context");
    }

    /// Number of known conversations
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
