//! Image-generation client.
//!
//! An image request is a single queue phase carrying the positional
//! parameter record. The completion lists the files the backend wrote, which
//! are then downloaded over plain HTTP from the same host.

mod fetch;
mod parameters;

pub use fetch::{AssetFetcher, GeneratedImage};
pub use parameters::{ImageOverrides, ParameterSet};

use serde_json::Value;
use tracing::info;

use crate::config::ImageGenConfig;
use crate::error::{DecodeError, RelayResult};
use crate::gradio::decoder::image_descriptors;
use crate::gradio::{ImageDescriptor, Invocation, PacketOutput, Phase, PhaseKind, Session};

/// Client for the image-generation queue server
pub struct ImageGenClient {
    config: ImageGenConfig,
    fetcher: AssetFetcher,
}

impl ImageGenClient {
    pub fn new(config: ImageGenConfig) -> RelayResult<Self> {
        let fetcher = AssetFetcher::new(config.host.clone(), config.request_timeout())?;
        Ok(Self { config, fetcher })
    }

    #[cfg(test)]
    fn with_fetcher(config: ImageGenConfig, fetcher: AssetFetcher) -> Self {
        Self { config, fetcher }
    }

    /// Configured defaults with `overrides` applied
    pub fn parameters(&self, overrides: &ImageOverrides) -> ParameterSet {
        let mut parameters = ParameterSet::from_defaults(&self.config.defaults);
        parameters.apply(overrides);
        parameters
    }

    /// Run txt2img and download every produced image.
    ///
    /// Either all images are returned or the call fails.
    pub async fn run_image_generation(
        &self,
        session: &Session,
        parameters: &ParameterSet,
    ) -> RelayResult<Vec<GeneratedImage>> {
        info!(
            host = %self.config.host,
            task_id = %parameters.task_id,
            "Running image generation"
        );

        let mut invocation = Invocation::new(&self.config.host, session);
        let phase = ImagePhase {
            fn_index: self.config.fn_index,
            parameters,
        };
        let descriptors = invocation.run_phase(phase, &mut |_: &str| {}).await?;
        invocation.finish();

        let images = self.fetcher.fetch_all(&descriptors).await?;
        info!(count = images.len(), task_id = %parameters.task_id, "Images generated");
        Ok(images)
    }
}

/// The single txt2img call. Intermediate pushes carry previews only.
struct ImagePhase<'a> {
    fn_index: u32,
    parameters: &'a ParameterSet,
}

impl Phase for ImagePhase<'_> {
    type Output = Vec<ImageDescriptor>;

    fn kind(&self) -> PhaseKind {
        PhaseKind::Generate
    }

    fn fn_index(&self) -> u32 {
        self.fn_index
    }

    fn payload(&self) -> RelayResult<Value> {
        Ok(serde_json::to_value(self.parameters).map_err(DecodeError::Encode)?)
    }

    fn on_completed(self, output: Option<&PacketOutput>) -> RelayResult<Self::Output> {
        Ok(image_descriptors(output)?)
    }
}
