use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod loader;

pub use loader::load_config;

/// Relay configuration, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_textgen")]
    pub textgen: TextGenConfig,

    #[serde(default = "default_image")]
    pub image: ImageGenConfig,

    #[serde(default = "default_console")]
    pub console: ConsoleConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            textgen: default_textgen(),
            image: default_image(),
            console: default_console(),
        }
    }
}

/// Text-generation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextGenConfig {
    /// `host:port` of the text-generation queue server
    #[serde(default = "default_textgen_host")]
    pub host: String,

    /// Remote function index of the priming phase
    #[serde(default = "default_prime_fn_index")]
    pub prime_fn_index: u32,

    /// Remote function index of the generation phase
    #[serde(default = "default_generate_fn_index")]
    pub generate_fn_index: u32,

    /// Speaker token marking bot turns in the transcript
    #[serde(default = "default_bot_token")]
    pub bot_token: String,

    /// Speaker token marking human turns in the transcript
    #[serde(default = "default_human_token")]
    pub human_token: String,

    /// System preamble placed at the top of every prompt
    #[serde(default = "default_preamble")]
    pub preamble: String,

    /// Budget for the rendered prompt, counted in whitespace-delimited words
    #[serde(default = "default_maximum_prompt_tokens")]
    pub maximum_prompt_tokens: usize,

    #[serde(default)]
    pub priming: PrimingConfig,
}

/// Hyperparameters sent during the priming phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimingConfig {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    /// -1 lets the backend pick a random seed
    #[serde(default = "default_priming_seed")]
    pub seed: i64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    #[serde(default = "default_typical_p")]
    pub typical_p: f64,

    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f64,

    #[serde(default = "default_encoder_repetition_penalty")]
    pub encoder_repetition_penalty: f64,

    #[serde(default)]
    pub no_repeat_ngram_size: u32,

    #[serde(default)]
    pub min_length: u32,

    #[serde(default = "default_do_sample")]
    pub do_sample: bool,
}

impl Default for PrimingConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            seed: default_priming_seed(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            typical_p: default_typical_p(),
            repetition_penalty: default_repetition_penalty(),
            encoder_repetition_penalty: default_encoder_repetition_penalty(),
            no_repeat_ngram_size: 0,
            min_length: 0,
            do_sample: default_do_sample(),
        }
    }
}

/// Image-generation backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenConfig {
    /// `host:port` of the image queue server, also serving `/file=` downloads
    #[serde(default = "default_image_host")]
    pub host: String,

    /// Remote function index of the txt2img call
    #[serde(default)]
    pub fn_index: u32,

    /// Timeout for each image download in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub defaults: ImageDefaults,
}

impl ImageGenConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Default generation parameters applied before user overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDefaults {
    #[serde(default = "default_sampler")]
    pub sampler: String,

    #[serde(default = "default_sample_steps")]
    pub sample_steps: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,

    #[serde(default = "default_image_seed")]
    pub seed: i32,

    #[serde(default = "default_dimension")]
    pub width: u32,

    #[serde(default = "default_dimension")]
    pub height: u32,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            sampler: default_sampler(),
            sample_steps: default_sample_steps(),
            batch_size: default_batch_size(),
            cfg_scale: default_cfg_scale(),
            seed: default_image_seed(),
            width: default_dimension(),
            height: default_dimension(),
        }
    }
}

/// Console front-end configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_conversation_id")]
    pub conversation_id: String,

    #[serde(default = "default_user_id")]
    pub user_id: String,

    #[serde(default = "default_user_name")]
    pub user_name: String,

    /// Where generated images are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

// ==================== Default Value Functions ====================

fn default_textgen() -> TextGenConfig {
    TextGenConfig {
        host: default_textgen_host(),
        prime_fn_index: default_prime_fn_index(),
        generate_fn_index: default_generate_fn_index(),
        bot_token: default_bot_token(),
        human_token: default_human_token(),
        preamble: default_preamble(),
        maximum_prompt_tokens: default_maximum_prompt_tokens(),
        priming: PrimingConfig::default(),
    }
}

fn default_textgen_host() -> String {
    "127.0.0.1:7860".to_string()
}

fn default_prime_fn_index() -> u32 {
    8
}

fn default_generate_fn_index() -> u32 {
    9
}

fn default_bot_token() -> String {
    "### Assistant:".to_string()
}

fn default_human_token() -> String {
    "### Human:".to_string()
}

fn default_preamble() -> String {
    "A chat between a curious human and an artificial intelligence assistant. \
     The assistant gives helpful, detailed, and polite answers to the human's questions."
        .to_string()
}

fn default_maximum_prompt_tokens() -> usize {
    1024
}

fn default_max_new_tokens() -> u32 {
    1512
}

fn default_priming_seed() -> i64 {
    -1
}

fn default_temperature() -> f64 {
    1.99
}

fn default_top_p() -> f64 {
    0.18
}

fn default_top_k() -> u32 {
    30
}

fn default_typical_p() -> f64 {
    1.0
}

fn default_repetition_penalty() -> f64 {
    1.15
}

fn default_encoder_repetition_penalty() -> f64 {
    1.0
}

fn default_do_sample() -> bool {
    true
}

fn default_image() -> ImageGenConfig {
    ImageGenConfig {
        host: default_image_host(),
        fn_index: 0,
        request_timeout_secs: default_request_timeout_secs(),
        defaults: ImageDefaults::default(),
    }
}

fn default_image_host() -> String {
    "127.0.0.1:7861".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_sampler() -> String {
    "Euler a".to_string()
}

fn default_sample_steps() -> u32 {
    20
}

fn default_batch_size() -> u32 {
    1
}

fn default_cfg_scale() -> f64 {
    7.0
}

fn default_image_seed() -> i32 {
    -1
}

fn default_dimension() -> u32 {
    512
}

fn default_console() -> ConsoleConfig {
    ConsoleConfig {
        conversation_id: default_conversation_id(),
        user_id: default_user_id(),
        user_name: default_user_name(),
        output_dir: default_output_dir(),
    }
}

fn default_conversation_id() -> String {
    "console".to_string()
}

fn default_user_id() -> String {
    "console-user".to_string()
}

fn default_user_name() -> String {
    "You".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./images")
}
