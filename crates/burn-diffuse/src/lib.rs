//! Latent-diffusion sampling engine
//!
//! Drives a frozen set of diffusion sub-models (denoiser, autoencoder,
//! optional control network, depth estimator and segmenter) through the
//! guided sampling loop: schedule setup, multi-modal guidance
//! composition, integrator stepping, inpaint compositing and decoding.
//! Model loading and text encoding are collaborator responsibilities;
//! the engine receives ready tensors and trait objects.

pub mod codec;
pub mod compose;
pub mod config;
pub mod denoise;
pub mod engine;
pub mod error;
pub mod invert;
pub mod models;
pub mod offload;
pub mod prep;
pub mod sample;
pub mod stats;

pub use codec::{decode_latent, encode_pixels, replicate_batch, Latent};
pub use compose::{Conditioning, GuidanceMode};
pub use config::{
    BackendCaps, DebugConfig, GenConfig, ModelVariant, Precision, PredictionKind, SamplerKind,
};
pub use denoise::{GuidedDenoiser, SideChannels};
pub use engine::{Engine, SideInputs};
pub use error::EngineError;
pub use models::{
    Component, ControlNet, ControlResiduals, Denoiser, DepthEstimator, DiagonalGaussian,
    EngineModels, Segmenter, VaeCodec,
};
pub use offload::{DeviceArbiter, DeviceLease};
pub use prep::{MaskSource, PreparedMask};
pub use sample::{SamplePhase, StepCallback, StepInfo, StepOutput};
