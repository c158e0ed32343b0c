//! Text-generation client.
//!
//! A text inference is two phases against the same host: a priming call that
//! installs the sampling hyperparameters and stop strings, then the generation
//! call carrying the rendered prompt. The remote closes the socket after each
//! completion, so every phase dials again.

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::{PrimingConfig, TextGenConfig};
use crate::error::RelayResult;
use crate::gradio::decoder::{extract_bot_turn, text_output, transcript};
use crate::gradio::{Invocation, PacketOutput, Phase, PhaseKind, ServerPacket, Session};

/// Client for the text-generation queue server
pub struct TextGenClient {
    config: TextGenConfig,
}

impl TextGenClient {
    pub fn new(config: TextGenConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TextGenConfig {
        &self.config
    }

    /// Run one text inference for `prompt`.
    ///
    /// `on_update` receives the bot's cumulative turn on every streamed update;
    /// `on_complete` receives the final turn once, which is also returned.
    pub async fn run_inference(
        &self,
        session: &Session,
        prompt: &str,
        mut on_update: impl FnMut(&str),
        on_complete: impl FnOnce(&str),
    ) -> RelayResult<String> {
        info!(
            host = %self.config.host,
            prompt_words = prompt.split_whitespace().count(),
            "Running text inference"
        );

        let mut invocation = Invocation::new(&self.config.host, session);

        invocation
            .run_phase(PrimePhase::new(&self.config), &mut |_: &str| {})
            .await?;

        let reply = invocation
            .run_phase(GeneratePhase::new(&self.config, prompt), &mut on_update)
            .await?;
        invocation.finish();

        on_complete(&reply);
        Ok(reply)
    }
}

/// Installs the sampling parameters ahead of generation
pub struct PrimePhase<'a> {
    config: &'a TextGenConfig,
}

impl<'a> PrimePhase<'a> {
    pub fn new(config: &'a TextGenConfig) -> Self {
        Self { config }
    }
}

impl Phase for PrimePhase<'_> {
    type Output = ();

    fn kind(&self) -> PhaseKind {
        PhaseKind::Prepare
    }

    fn fn_index(&self) -> u32 {
        self.config.prime_fn_index
    }

    fn payload(&self) -> RelayResult<Value> {
        Ok(priming_payload(
            &self.config.priming,
            &self.config.human_token,
            &self.config.bot_token,
        ))
    }

    fn on_completed(self, _output: Option<&PacketOutput>) -> RelayResult<()> {
        debug!("Priming accepted");
        Ok(())
    }
}

/// Positional priming arguments: hyperparameters, five fixed backend flags,
/// then the stop strings.
fn priming_payload(priming: &PrimingConfig, human_token: &str, bot_token: &str) -> Value {
    json!([
        priming.max_new_tokens,
        priming.seed,
        priming.temperature,
        priming.top_p,
        priming.top_k,
        priming.typical_p,
        priming.repetition_penalty,
        priming.encoder_repetition_penalty,
        priming.no_repeat_ngram_size,
        priming.min_length,
        priming.do_sample,
        0,
        1,
        1,
        false,
        true,
        stop_strings(human_token, bot_token),
    ])
}

/// The backend parses this slot as a comma-separated list of quoted strings
/// with escaped newlines.
fn stop_strings(human_token: &str, bot_token: &str) -> String {
    format!("\"\\n{}\", \"\\n{}\"", human_token, bot_token)
}

/// Streams the model's continuation of the prompt
pub struct GeneratePhase<'a> {
    config: &'a TextGenConfig,
    prompt: &'a str,
}

impl<'a> GeneratePhase<'a> {
    pub fn new(config: &'a TextGenConfig, prompt: &'a str) -> Self {
        Self { config, prompt }
    }

    fn turn(&self, transcript: &str) -> RelayResult<String> {
        Ok(extract_bot_turn(
            transcript,
            &self.config.bot_token,
            &self.config.human_token,
        )?)
    }
}

impl Phase for GeneratePhase<'_> {
    type Output = String;

    fn kind(&self) -> PhaseKind {
        PhaseKind::Generate
    }

    fn fn_index(&self) -> u32 {
        self.config.generate_fn_index
    }

    fn payload(&self) -> RelayResult<Value> {
        Ok(json!([self.prompt, null]))
    }

    fn on_generating(&mut self, packet: &ServerPacket) -> RelayResult<Option<String>> {
        let transcript = text_output(packet)?;
        self.turn(transcript).map(Some)
    }

    fn on_completed(self, output: Option<&PacketOutput>) -> RelayResult<String> {
        self.turn(transcript(output)?)
    }
}
