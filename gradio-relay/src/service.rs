use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::context::{ContextMessage, ContextRegistry, PromptSettings, SharedContext};
use crate::error::RelayResult;
use crate::gradio::SessionProvider;
use crate::imagegen::{GeneratedImage, ImageGenClient, ImageOverrides};
use crate::textgen::TextGenClient;

/// Main relay coordinator: one session, one context store, both backends
pub struct RelayService {
    sessions: SessionProvider,
    contexts: ContextRegistry,
    textgen: TextGenClient,
    imagegen: ImageGenClient,
}

impl RelayService {
    pub fn new(config: RelayConfig) -> RelayResult<Self> {
        info!(
            textgen_host = %config.textgen.host,
            image_host = %config.image.host,
            "Initializing relay service"
        );

        let contexts = ContextRegistry::new(PromptSettings::from(&config.textgen));
        let imagegen = ImageGenClient::new(config.image)?;

        Ok(Self {
            sessions: SessionProvider::new(),
            contexts,
            textgen: TextGenClient::new(config.textgen),
            imagegen,
        })
    }

    /// Add a user message to a conversation and generate the bot's reply.
    ///
    /// `on_update` sees the reply as it streams. On success the reply is
    /// appended to the conversation; on failure only the user message remains.
    pub async fn chat(
        &self,
        conversation_id: &str,
        message: ContextMessage,
        on_update: impl FnMut(&str),
    ) -> RelayResult<String> {
        let context = self.contexts.get_context(conversation_id);
        debug!(
            conversation_id = %conversation_id,
            author = %message.author.display_name,
            conversations = self.contexts.len(),
            "Chat message received"
        );

        let prompt = {
            let mut context = context.lock().unwrap();
            context.add_message(message);
            debug!(conversation_id = %conversation_id, messages = context.len(), "Rendered prompt");
            context.render_prompt()
        };

        let session = self.sessions.get_session();
        let reply = self
            .textgen
            .run_inference(session, &prompt, on_update, |reply| {
                debug!(conversation_id = %conversation_id, chars = reply.len(), "Reply complete");
            })
            .await?;

        let bot_token = &self.textgen.config().bot_token;
        context
            .lock()
            .unwrap()
            .add_message(ContextMessage::from_bot(bot_token, reply.clone()));

        Ok(reply)
    }

    /// Generate images from the configured defaults and `overrides`
    pub async fn generate_images(&self, overrides: &ImageOverrides) -> RelayResult<Vec<GeneratedImage>> {
        let parameters = self.imagegen.parameters(overrides);
        self.imagegen
            .run_image_generation(self.sessions.get_session(), &parameters)
            .await
    }

    pub fn reset_conversation(&self, conversation_id: &str) {
        info!(conversation_id = %conversation_id, "Resetting conversation");
        self.contexts.reset(conversation_id);
    }

    pub fn context(&self, conversation_id: &str) -> SharedContext {
        self.contexts.get_context(conversation_id)
    }
}
