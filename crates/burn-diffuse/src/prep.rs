//! Side-input preparation
//!
//! Turns caller-level side inputs (masks, depth) into the
//! latent-resolution tensors the denoise step consumes. Everything here
//! runs once per generation call, before the loop.

use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

use crate::codec::encode_pixels;
use crate::error::EngineError;
use crate::models::{DepthEstimator, Segmenter, VaeCodec};

/// Where the inpainting mask comes from
pub enum MaskSource<B: Backend> {
    /// Caller-provided soft mask at pixel resolution, `[1, 1, H, W]`,
    /// 1 = preserved region
    Tensor(Tensor<B, 4>),
    /// Textual region description, rasterized by the segmentation model
    Region(String),
}

/// Latent-resolution mask pair consumed by the denoise step
#[derive(Debug, Clone)]
pub struct PreparedMask<B: Backend> {
    /// `[1, 1, h, w]` at latent resolution
    pub mask: Tensor<B, 4>,
    /// Latent of the source image with the edit region blanked
    pub masked_latent: Tensor<B, 4>,
}

/// Resolve and downsample a mask, and encode the protected source.
///
/// `noise` selects the posterior sample for the masked-latent encode;
/// `None` takes the mean.
pub fn prepare_mask<B: Backend>(
    source: MaskSource<B>,
    image: &Tensor<B, 4>,
    invert: bool,
    segmenter: Option<&dyn Segmenter<B>>,
    vae: &dyn VaeCodec<B>,
    scale_factor: f64,
    vae_scale: usize,
    noise: Option<Tensor<B, 4>>,
) -> Result<PreparedMask<B>, EngineError> {
    let mask = match source {
        MaskSource::Tensor(mask) => mask,
        MaskSource::Region(region) => segmenter
            .ok_or_else(|| EngineError::SegmenterMissing(region.clone()))?
            .segment(image.clone(), &region),
    };
    let mask = if invert { mask.neg() + 1.0 } else { mask };

    let masked_latent = encode_pixels(vae, image.clone() * mask.clone(), scale_factor, noise);

    let [_, _, height, width] = image.dims();
    let mask = interpolate(
        mask,
        [height / vae_scale, width / vae_scale],
        InterpolateOptions::new(InterpolateMode::Bicubic),
    )
    .clamp(0.0, 1.0);

    Ok(PreparedMask {
        mask,
        masked_latent,
    })
}

/// Estimate depth and normalize it into the conditioning channel.
///
/// The estimate is resized to latent resolution and min-max normalized
/// to `[-1, 1]` per sample.
pub fn prepare_depth<B: Backend>(
    image: &Tensor<B, 4>,
    estimator: &dyn DepthEstimator<B>,
    vae_scale: usize,
) -> Tensor<B, 4> {
    let [_, _, height, width] = image.dims();
    let depth = estimator.forward(image.clone());
    let depth = interpolate(
        depth,
        [height / vae_scale, width / vae_scale],
        InterpolateOptions::new(InterpolateMode::Bicubic),
    );

    let min = depth.clone().min_dim(1).min_dim(2).min_dim(3);
    let max = depth.clone().max_dim(1).max_dim(2).max_dim(3);
    let range = max - min.clone();
    (depth - min) / range * 2.0 - 1.0
}
