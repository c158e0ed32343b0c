//! Positional parameter record for the txt2img call.
//!
//! The backend takes its arguments as one flat array. Slots whose meaning is
//! known are named fields; the rest are carried through at the values the web
//! UI sends.

use rand::Rng;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::ImageDefaults;

/// Number of positional arguments the txt2img call expects
pub const PARAMETER_COUNT: usize = 51;

/// Smallest and largest accepted image side, in pixels
const MIN_DIMENSION: u32 = 512;
const MAX_DIMENSION: u32 = 768;

const SAMPLERS: [&str; 3] = ["Euler a", "Euler", "DPM++ 2M Karras"];

/// Arguments of one txt2img call
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    pub task_id: String,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub sample_steps: u32,
    pub sampler: String,
    pub restore_faces: bool,
    pub tiling: bool,
    pub batch_count: u32,
    pub batch_size: u32,
    pub cfg_scale: f64,
    /// -1 lets the backend pick
    pub seed: i32,
    pub height: u32,
    pub width: u32,
    pub hires_fix: bool,
    pub denoising_strength: f64,
    pub upscale_by: f64,
    pub upscaler: String,
    pub hires_steps: u32,
    pub resize_width_to: u32,
    pub resize_height_to: u32,
    pub script: String,
    pub x_type: String,
    opaque: OpaqueSlots,
}

/// Slots with no known meaning, grouped by the named field they follow
#[derive(Debug, Clone, PartialEq)]
struct OpaqueSlots {
    after_negative_prompt: Value,
    after_seed: [Value; 5],
    after_resize: Value,
    after_script: [Value; 8],
    after_x_type: [Value; 14],
}

impl Default for OpaqueSlots {
    fn default() -> Self {
        Self {
            after_negative_prompt: json!([]),
            after_seed: [json!(-1), json!(0), json!(0), json!(0), json!(false)],
            after_resize: json!([]),
            after_script: [
                json!(false),
                json!(false),
                json!("positive"),
                json!("comma"),
                json!(0),
                json!(false),
                json!(false),
                json!(""),
            ],
            after_x_type: [
                json!(""),
                json!("Nothing"),
                json!(""),
                json!("Nothing"),
                json!(""),
                json!(true),
                json!(false),
                json!(false),
                json!(false),
                json!(0),
                json!([]),
                json!(""),
                json!(""),
                json!(""),
            ],
        }
    }
}

/// User-supplied values layered over the configured defaults.
///
/// Everything except the positive prompt is raw user text and is validated
/// when applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageOverrides {
    pub positive_prompt: String,
    pub negative_prompt: Option<String>,
    /// `"<width>x<height>"`
    pub size: Option<String>,
    pub seed: Option<String>,
    pub sampler: Option<String>,
}

impl ImageOverrides {
    pub fn prompt(positive_prompt: impl Into<String>) -> Self {
        Self {
            positive_prompt: positive_prompt.into(),
            ..Default::default()
        }
    }
}

impl ParameterSet {
    /// Build a parameter set from configured defaults with a fresh task id
    pub fn from_defaults(defaults: &ImageDefaults) -> Self {
        Self {
            task_id: generate_task_id(),
            positive_prompt: String::new(),
            negative_prompt: String::new(),
            sample_steps: defaults.sample_steps,
            sampler: defaults.sampler.clone(),
            restore_faces: false,
            tiling: false,
            batch_count: 1,
            batch_size: defaults.batch_size,
            cfg_scale: defaults.cfg_scale,
            seed: defaults.seed,
            height: defaults.height,
            width: defaults.width,
            hires_fix: false,
            denoising_strength: 0.7,
            upscale_by: 2.0,
            upscaler: "Latent".to_string(),
            hires_steps: 0,
            resize_width_to: 0,
            resize_height_to: 0,
            script: "None".to_string(),
            x_type: "Seed".to_string(),
            opaque: OpaqueSlots::default(),
        }
    }

    /// Layer user overrides on top; invalid values keep the current setting
    pub fn apply(&mut self, overrides: &ImageOverrides) {
        self.positive_prompt = overrides.positive_prompt.clone();

        if let Some(negative) = &overrides.negative_prompt {
            self.negative_prompt = negative.clone();
        }

        if let Some(size) = overrides.size.as_deref() {
            match parse_size(size) {
                Some((width, height)) => {
                    self.width = width;
                    self.height = height;
                }
                None => warn!(size = %size, "Ignoring invalid image size"),
            }
        }

        if let Some(seed) = overrides.seed.as_deref() {
            match parse_seed(seed) {
                Some(seed) => self.seed = seed,
                None => warn!(seed = %seed, "Ignoring invalid seed"),
            }
        }

        if let Some(sampler) = overrides.sampler.as_deref() {
            match normalise_sampler(sampler) {
                Some(sampler) => self.sampler = sampler.to_string(),
                None => warn!(sampler = %sampler, "Ignoring unknown sampler"),
            }
        }

        debug!(
            task_id = %self.task_id,
            width = self.width,
            height = self.height,
            seed = self.seed,
            sampler = %self.sampler,
            "Applied image overrides"
        );
    }
}

impl Serialize for ParameterSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(PARAMETER_COUNT))?;

        seq.serialize_element(&self.task_id)?;
        seq.serialize_element(&self.positive_prompt)?;
        seq.serialize_element(&self.negative_prompt)?;
        seq.serialize_element(&self.opaque.after_negative_prompt)?;
        seq.serialize_element(&self.sample_steps)?;
        seq.serialize_element(&self.sampler)?;
        seq.serialize_element(&self.restore_faces)?;
        seq.serialize_element(&self.tiling)?;
        seq.serialize_element(&self.batch_count)?;
        seq.serialize_element(&self.batch_size)?;
        seq.serialize_element(&self.cfg_scale)?;
        seq.serialize_element(&self.seed)?;
        for value in &self.opaque.after_seed {
            seq.serialize_element(value)?;
        }
        seq.serialize_element(&self.height)?;
        seq.serialize_element(&self.width)?;
        seq.serialize_element(&self.hires_fix)?;
        seq.serialize_element(&self.denoising_strength)?;
        seq.serialize_element(&self.upscale_by)?;
        seq.serialize_element(&self.upscaler)?;
        seq.serialize_element(&self.hires_steps)?;
        seq.serialize_element(&self.resize_width_to)?;
        seq.serialize_element(&self.resize_height_to)?;
        seq.serialize_element(&self.opaque.after_resize)?;
        seq.serialize_element(&self.script)?;
        for value in &self.opaque.after_script {
            seq.serialize_element(value)?;
        }
        seq.serialize_element(&self.x_type)?;
        for value in &self.opaque.after_x_type {
            seq.serialize_element(value)?;
        }

        seq.end()
    }
}

fn generate_task_id() -> String {
    let id: i64 = rand::thread_rng().gen_range(0..=i64::MAX);
    format!("task({})", id)
}

/// Parse `"<w>x<h>"`, accepting only sides the model was trained for
fn parse_size(value: &str) -> Option<(u32, u32)> {
    let (width, height) = value.trim().split_once('x')?;
    let width: u32 = width.trim().parse().ok()?;
    let height: u32 = height.trim().parse().ok()?;

    let valid = |side: u32| (MIN_DIMENSION..=MAX_DIMENSION).contains(&side);
    (valid(width) && valid(height)).then_some((width, height))
}

/// Only explicit positive seeds override the default
fn parse_seed(value: &str) -> Option<i32> {
    value.trim().parse::<i32>().ok().filter(|seed| *seed > 0)
}

fn normalise_sampler(value: &str) -> Option<&'static str> {
    let value = value.trim();
    SAMPLERS
        .into_iter()
        .find(|sampler| sampler.eq_ignore_ascii_case(value))
}
