//! Engine configuration
//!
//! Everything the original system probed at runtime (model channel
//! counts, optional backends) is resolved here once, as typed
//! configuration, before the first denoise call.

use std::str::FromStr;

use crate::error::EngineError;

/// Sampler algorithm selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SamplerKind {
    /// DDIM — residual family, deterministic (eta 0)
    #[default]
    Ddim,
    /// Linear multistep over sigmas
    Klms,
    /// Euler
    Euler,
    /// Euler ancestral
    EulerA,
    /// DPM2 ancestral — slow but rich
    Dpm2A,
}

impl SamplerKind {
    /// True for the continuous-sigma (ODE) family
    pub fn is_ode(&self) -> bool {
        !matches!(self, SamplerKind::Ddim)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SamplerKind::Ddim => "ddim",
            SamplerKind::Klms => "klms",
            SamplerKind::Euler => "euler",
            SamplerKind::EulerA => "euler_a",
            SamplerKind::Dpm2A => "dpm2_a",
        }
    }
}

impl FromStr for SamplerKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ddim" => Ok(SamplerKind::Ddim),
            "klms" => Ok(SamplerKind::Klms),
            "euler" => Ok(SamplerKind::Euler),
            "euler_a" => Ok(SamplerKind::EulerA),
            "dpm2_a" => Ok(SamplerKind::Dpm2A),
            other => Err(EngineError::UnknownSampler(other.to_string())),
        }
    }
}

/// Model variant, fixed at engine construction and never re-inspected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelVariant {
    /// Plain text-to-image denoiser (4 latent channels)
    #[default]
    Standard,
    /// Inpainting architecture (latent + mask + masked latent, 9 channels)
    Inpaint,
    /// Depth-conditioned architecture (latent + depth, 5 channels)
    Depth,
    /// Instruct pixel-edit architecture (latent + edit latent, 8 channels)
    PixelEdit,
}

impl ModelVariant {
    /// Input channels the denoiser of this variant expects
    pub fn denoiser_in_channels(&self) -> usize {
        match self {
            ModelVariant::Standard => 4,
            ModelVariant::Inpaint => 9,
            ModelVariant::Depth => 5,
            ModelVariant::PixelEdit => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelVariant::Standard => "standard",
            ModelVariant::Inpaint => "inpaint",
            ModelVariant::Depth => "depth",
            ModelVariant::PixelEdit => "pixel-edit",
        }
    }
}

/// What the denoiser's output parameterizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PredictionKind {
    /// Output is the noise estimate directly
    #[default]
    Epsilon,
    /// Output is the v-parameterization; converted to epsilon per call.
    /// These model families need the optimized attention backend.
    Velocity,
}

/// Numeric precision policy
///
/// Burn backends own their element type, so this is carried as typed
/// configuration for callers and validation; there is no engine-side
/// autocast scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    Half,
    Full,
}

/// Host capabilities resolved once at setup (no runtime probing)
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendCaps {
    /// Optimized attention backend compiled in
    pub flash_attention: bool,
}

/// Debug flags for sampler diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugConfig {
    /// Print sampler debug info (schedule, latent stats)
    pub sampler: bool,
    /// Panic on NaN/Inf values in tensors
    pub nan: bool,
}

/// Configuration record for one engine instance
#[derive(Debug, Clone)]
pub struct GenConfig {
    pub sampler: SamplerKind,
    pub steps: usize,
    /// Fraction of the schedule actually executed (image-to-image)
    pub strength: f64,
    pub cfg_scale: f32,
    pub batch: usize,
    pub seed: Option<u64>,
    /// Single-owner device residency for sub-models
    pub lowmem: bool,
    pub precision: Precision,
    pub prediction: PredictionKind,
    /// DDIM stochasticity parameter
    pub ddim_eta: f64,
    /// Control-network residual strength
    pub control_scale: f32,
    /// Image-guidance scale; set only for pixel-edit mode
    pub img_scale: Option<f32>,
    /// Spatial downsampling factor of the latent space
    pub vae_scale: usize,
    /// Latent scaling constant of the decoder
    pub latent_scale_factor: f64,
    pub debug: DebugConfig,
}

impl Default for GenConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerKind::Ddim,
            steps: 50,
            strength: 1.0,
            cfg_scale: 7.5,
            batch: 1,
            seed: None,
            lowmem: false,
            precision: Precision::Half,
            prediction: PredictionKind::Epsilon,
            ddim_eta: 0.0,
            control_scale: 1.0,
            img_scale: None,
            vae_scale: 8,
            latent_scale_factor: 0.18215,
            debug: DebugConfig::default(),
        }
    }
}

impl GenConfig {
    /// Validate the configuration against the chosen variant and the
    /// externally supplied capabilities. All fatal conditions surface
    /// here, before the first denoise call.
    pub fn validate(
        &self,
        variant: ModelVariant,
        caps: BackendCaps,
        has_control_net: bool,
        offload_capable: bool,
    ) -> Result<(), EngineError> {
        if self.img_scale.is_some() {
            if has_control_net {
                return Err(EngineError::GuidanceConflict);
            }
            if self.cfg_scale == 0.0 || self.cfg_scale == 1.0 {
                return Err(EngineError::PixelEditNeedsGuidance);
            }
        }
        if self.prediction == PredictionKind::Velocity && !caps.flash_attention {
            return Err(EngineError::AttentionBackendMissing("v-prediction"));
        }
        if self.lowmem && !offload_capable {
            return Err(EngineError::OffloadUnavailable);
        }
        let _ = variant;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_parse() {
        assert_eq!("ddim".parse::<SamplerKind>().unwrap(), SamplerKind::Ddim);
        assert_eq!("euler_a".parse::<SamplerKind>().unwrap(), SamplerKind::EulerA);
        assert!(matches!(
            "plms".parse::<SamplerKind>(),
            Err(EngineError::UnknownSampler(_))
        ));
    }

    #[test]
    fn test_variant_channels() {
        assert_eq!(ModelVariant::Standard.denoiser_in_channels(), 4);
        assert_eq!(ModelVariant::Inpaint.denoiser_in_channels(), 9);
        assert_eq!(ModelVariant::Depth.denoiser_in_channels(), 5);
        assert_eq!(ModelVariant::PixelEdit.denoiser_in_channels(), 8);
    }

    #[test]
    fn test_pixel_edit_conflicts() {
        let config = GenConfig {
            img_scale: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(ModelVariant::PixelEdit, BackendCaps::default(), true, true),
            Err(EngineError::GuidanceConflict)
        ));

        let flat = GenConfig {
            img_scale: Some(1.5),
            cfg_scale: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            flat.validate(ModelVariant::PixelEdit, BackendCaps::default(), false, true),
            Err(EngineError::PixelEditNeedsGuidance)
        ));
    }

    #[test]
    fn test_lowmem_needs_offload() {
        let config = GenConfig {
            lowmem: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(ModelVariant::Standard, BackendCaps::default(), false, false),
            Err(EngineError::OffloadUnavailable)
        ));
        assert!(config
            .validate(ModelVariant::Standard, BackendCaps::default(), false, true)
            .is_ok());
    }

    #[test]
    fn test_velocity_needs_attention_backend() {
        let config = GenConfig {
            prediction: PredictionKind::Velocity,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(ModelVariant::Standard, BackendCaps::default(), false, true),
            Err(EngineError::AttentionBackendMissing(_))
        ));
        let caps = BackendCaps {
            flash_attention: true,
        };
        assert!(config
            .validate(ModelVariant::Standard, caps, false, true)
            .is_ok());
    }
}
