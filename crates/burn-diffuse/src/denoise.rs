//! Guidance-aware denoise step
//!
//! One noise prediction: inject the side channels the model variant
//! expects, expand the latent batch across guidance blocks, run the
//! (optionally control-conditioned) denoiser once, and fold the
//! per-block predictions into a single guided estimate.

use burn::prelude::*;

use burn_diffuse_samplers::{combine_pixel_edit, combine_weighted};

use crate::compose::GuidanceMode;
use crate::config::{DebugConfig, ModelVariant, PredictionKind};
use crate::models::{ControlResiduals, EngineModels};
use crate::offload::DeviceArbiter;
use crate::stats::{trap_non_finite_if, TensorReport};
use burn_diffuse_samplers::NoiseSchedule;

/// Optional per-run tensors injected into the denoise call.
///
/// All latent-resolution, prepared once before the loop; absence of a
/// field simply skips its pathway.
#[derive(Default)]
pub struct SideChannels<B: Backend> {
    /// Inpainting mask at latent resolution, `[b, 1, h, w]`, 1 = preserved
    pub mask: Option<Tensor<B, 4>>,
    /// Latent of the mask-protected source image
    pub masked_latent: Option<Tensor<B, 4>>,
    /// Depth map at latent resolution, `[b, 1, h, w]`
    pub depth: Option<Tensor<B, 4>>,
    /// Edit-source latent for the pixel-edit architecture
    pub edit_latent: Option<Tensor<B, 4>>,
    /// Control-network hint image, pixel resolution
    pub control_hint: Option<Tensor<B, 4>>,
}

/// The guided model driven by the sampling loop.
///
/// Holds everything a single noise prediction needs; the loop calls
/// [`predict`](Self::predict) once per scheduled step (twice for the
/// midpoint method).
pub struct GuidedDenoiser<'a, B: Backend> {
    pub models: &'a mut EngineModels<B>,
    pub arbiter: DeviceArbiter,
    pub schedule: &'a NoiseSchedule,
    /// Composed conditioning, `[batch * blocks, seq, dim]`
    pub conditioning: Tensor<B, 3>,
    pub mode: GuidanceMode,
    pub weights: Vec<f32>,
    pub cfg_scale: f32,
    pub img_scale: f32,
    pub control_scale: f32,
    pub variant: ModelVariant,
    pub prediction: PredictionKind,
    /// Whether `noise_level` carries a sigma (ODE family) or a timestep
    pub sigma_space: bool,
    pub side: SideChannels<B>,
    pub debug: DebugConfig,
}

impl<B: Backend> GuidedDenoiser<'_, B> {
    /// One guided noise prediction at the given noise level.
    pub fn predict(&mut self, latent: Tensor<B, 4>, noise_level: f32) -> Tensor<B, 4> {
        let blocks = self.mode.num_blocks();

        // translate to the model's timestep axis; the ODE family feeds
        // the network a rescaled latent at an interpolated timestep
        let (mut x, timestep, alpha) = if self.sigma_space {
            let sigma = noise_level;
            let timestep = self.schedule.timestep_for_sigma(sigma);
            let c_in = 1.0 / (sigma * sigma + 1.0).sqrt();
            let alpha = self.schedule.alpha_cumprod_at(timestep.round() as usize);
            (latent * c_in, timestep, alpha)
        } else {
            let timestep = noise_level;
            let alpha = self.schedule.alpha_cumprod_at(timestep.round() as usize);
            (latent, timestep, alpha)
        };
        let x_core = x.clone();

        // side channels concatenate before block expansion
        match self.variant {
            ModelVariant::Inpaint => {
                let mask = self
                    .side
                    .mask
                    .clone()
                    .expect("inpaint variant without a prepared mask");
                let masked = self
                    .side
                    .masked_latent
                    .clone()
                    .expect("inpaint variant without a masked latent");
                x = Tensor::cat(vec![x, mask.neg() + 1.0, masked], 1);
            }
            ModelVariant::Depth => {
                let depth = self
                    .side
                    .depth
                    .clone()
                    .expect("depth variant without a depth map");
                x = Tensor::cat(vec![x, depth], 1);
            }
            ModelVariant::Standard | ModelVariant::PixelEdit => {}
        }

        // expand latents across guidance blocks
        if blocks > 1 {
            x = x.repeat_dim(0, blocks);
        }

        let residuals = self.control_residuals(&x, timestep);

        if let ModelVariant::PixelEdit = self.variant {
            let edit = self
                .side
                .edit_latent
                .clone()
                .expect("pixel-edit variant without an edit latent");
            let reps = x.dims()[0] / edit.dims()[0];
            let edit = edit.repeat_dim(0, reps);
            x = Tensor::cat(vec![x, edit], 1);
        }

        trap_non_finite_if(&x, "denoiser input", self.debug.nan);

        let out = {
            let denoiser = self.arbiter.lease(&mut *self.models.denoiser);
            denoiser.forward(x, timestep, self.conditioning.clone(), residuals.as_ref())
        };
        trap_non_finite_if(&out, "denoiser output", self.debug.nan);

        let out = match self.prediction {
            PredictionKind::Epsilon => out,
            PredictionKind::Velocity => {
                // v-parameterization: eps = sqrt(a) * v + sqrt(1 - a) * x
                let x_blocks = if blocks > 1 {
                    x_core.repeat_dim(0, blocks)
                } else {
                    x_core
                };
                out * alpha.sqrt() + x_blocks * (1.0 - alpha).sqrt()
            }
        };

        let guided = self.combine(out, blocks);
        if self.debug.sampler {
            eprintln!(
                "  noise_level={:.4} guided: {}",
                noise_level,
                TensorReport::of(&guided)
            );
        }
        guided
    }

    /// Run the control network, if one is active for this call.
    fn control_residuals(
        &mut self,
        x: &Tensor<B, 4>,
        timestep: f32,
    ) -> Option<ControlResiduals<B>> {
        let hint = self.side.control_hint.as_ref()?;
        let control_net = self.models.control_net.as_mut()?;

        let hint = hint
            .clone()
            .repeat_dim(0, x.dims()[0] / hint.dims()[0]);
        let residuals = {
            let control_net = self.arbiter.lease(&mut **control_net);
            control_net.forward(x.clone(), timestep, self.conditioning.clone(), hint)
        };
        Some(residuals.scaled(self.control_scale))
    }

    fn combine(&self, out: Tensor<B, 4>, blocks: usize) -> Tensor<B, 4> {
        match self.mode {
            GuidanceMode::UncondOnly | GuidanceMode::CondOnly => out,
            GuidanceMode::Weighted { .. } => {
                let chunks = out.chunk(blocks, 0);
                combine_weighted(&chunks, self.cfg_scale, &self.weights)
            }
            GuidanceMode::PixelEdit { .. } => {
                let chunks = out.chunk(blocks, 0);
                combine_pixel_edit(&chunks, self.cfg_scale, self.img_scale, &self.weights)
            }
        }
    }
}
