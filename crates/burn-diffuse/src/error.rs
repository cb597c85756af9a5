//! Engine error types
//!
//! All of these are configuration-validity errors detected at setup;
//! the loop itself never recovers or retries. Runtime shape mismatches
//! from malformed side-channel tensors propagate as backend panics.

use thiserror::Error;

/// Fatal, caller-visible engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("inpainting-architecture model requires a mask")]
    MaskRequired,

    #[error("pixel-edit guidance and control-network guidance are mutually exclusive")]
    GuidanceConflict,

    #[error("pixel-edit guidance needs cfg_scale outside {{0, 1}}")]
    PixelEditNeedsGuidance,

    #[error("unknown sampler '{0}'")]
    UnknownSampler(String),

    #[error("low-memory mode requires offload-capable sub-models")]
    OffloadUnavailable,

    #[error("model family '{0}' requires the optimized attention backend")]
    AttentionBackendMissing(&'static str),

    #[error("the {variant} variant requires a {expected}-channel denoiser, got {provided}")]
    ChannelMismatch {
        variant: &'static str,
        expected: usize,
        provided: usize,
    },

    #[error("trajectory inversion is only defined for the residual (ddim) sampler family")]
    InversionUnsupported,

    #[error("depth model variant requires a depth estimator")]
    DepthEstimatorMissing,

    #[error("mask region '{0}' requires a segmentation model")]
    SegmenterMissing(String),

    #[error("control image supplied but no control network is loaded")]
    ControlNetMissing,
}
