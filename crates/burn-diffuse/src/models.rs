//! Seams for the frozen sub-models
//!
//! The engine never loads weights; collaborators hand it fully
//! initialized objects behind these traits. Each trait also carries the
//! residency capability used by low-memory mode: a component moves to
//! device memory right before its forward pass and is evicted right
//! after.

use burn::prelude::*;

/// Device residency capability for a sub-model.
///
/// Default implementations are no-ops for models that always live on
/// the device; low-memory mode refuses to start unless every component
/// reports `offload_capable`.
pub trait Component {
    /// Move the weights to fast device memory
    fn to_device(&mut self) {}

    /// Evict the weights to host memory
    fn to_host(&mut self) {}

    /// Whether this component actually supports the host/device moves
    fn offload_capable(&self) -> bool {
        false
    }
}

/// Additive residuals produced by a control network
#[derive(Debug, Clone)]
pub struct ControlResiduals<B: Backend> {
    /// Per-resolution encoder residuals, outermost first
    pub down: Vec<Tensor<B, 4>>,
    /// Bottleneck residual
    pub mid: Tensor<B, 4>,
}

impl<B: Backend> ControlResiduals<B> {
    /// Scale every residual by the control strength
    pub fn scaled(self, control_scale: f32) -> Self {
        Self {
            down: self
                .down
                .into_iter()
                .map(|t| t * control_scale)
                .collect(),
            mid: self.mid * control_scale,
        }
    }
}

/// The denoising network
pub trait Denoiser<B: Backend>: Component {
    /// Input channels the network expects (4, 5, 8 or 9 by variant)
    fn in_channels(&self) -> usize;

    /// One noise prediction: latent batch + timestep + conditioning
    /// (+ optional control residuals) -> model output per batch row.
    fn forward(
        &self,
        latent: Tensor<B, 4>,
        timestep: f32,
        conditioning: Tensor<B, 3>,
        residuals: Option<&ControlResiduals<B>>,
    ) -> Tensor<B, 4>;
}

/// Diagonal-Gaussian posterior returned by the variational encoder
#[derive(Debug, Clone)]
pub struct DiagonalGaussian<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub std: Tensor<B, 4>,
}

impl<B: Backend> DiagonalGaussian<B> {
    /// Reparameterized sample using externally drawn unit noise
    pub fn sample(&self, noise: Tensor<B, 4>) -> Tensor<B, 4> {
        self.mean.clone() + self.std.clone() * noise
    }
}

/// The variational autoencoder pair
pub trait VaeCodec<B: Backend>: Component {
    /// Encode pixels to the posterior over latents
    fn encode(&self, pixels: Tensor<B, 4>) -> DiagonalGaussian<B>;

    /// Decode an (unscaled) latent back to pixels
    fn decode(&self, latent: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Auxiliary conditioning network producing additive residuals
pub trait ControlNet<B: Backend>: Component {
    fn forward(
        &self,
        latent: Tensor<B, 4>,
        timestep: f32,
        conditioning: Tensor<B, 3>,
        hint: Tensor<B, 4>,
    ) -> ControlResiduals<B>;
}

/// External monocular depth estimator
pub trait DepthEstimator<B: Backend>: Component {
    /// Predict depth for `[b, 3, h, w]` pixels as `[b, 1, h', w']`
    fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Text-driven segmentation model used for mask rasterization
pub trait Segmenter<B: Backend>: Component {
    /// Soft mask in [0, 1] for a textual region description,
    /// `[b, 1, h, w]` at image resolution
    fn segment(&self, image: Tensor<B, 4>, region: &str) -> Tensor<B, 4>;
}

/// The frozen sub-models one engine instance drives
pub struct EngineModels<B: Backend> {
    pub denoiser: Box<dyn Denoiser<B>>,
    pub vae: Box<dyn VaeCodec<B>>,
    pub control_net: Option<Box<dyn ControlNet<B>>>,
    pub depth_estimator: Option<Box<dyn DepthEstimator<B>>>,
    pub segmenter: Option<Box<dyn Segmenter<B>>>,
}

impl<B: Backend> EngineModels<B> {
    /// Minimal set: denoiser + codec
    pub fn new(denoiser: Box<dyn Denoiser<B>>, vae: Box<dyn VaeCodec<B>>) -> Self {
        Self {
            denoiser,
            vae,
            control_net: None,
            depth_estimator: None,
            segmenter: None,
        }
    }

    pub fn with_control_net(mut self, control_net: Box<dyn ControlNet<B>>) -> Self {
        self.control_net = Some(control_net);
        self
    }

    pub fn with_depth_estimator(mut self, depth: Box<dyn DepthEstimator<B>>) -> Self {
        self.depth_estimator = Some(depth);
        self
    }

    pub fn with_segmenter(mut self, segmenter: Box<dyn Segmenter<B>>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    /// True when every present component supports host/device moves
    pub fn offload_capable(&self) -> bool {
        self.denoiser.offload_capable()
            && self.vae.offload_capable()
            && self.control_net.as_ref().map_or(true, |c| c.offload_capable())
            && self
                .depth_estimator
                .as_ref()
                .map_or(true, |d| d.offload_capable())
    }
}
