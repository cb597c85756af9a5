//! Sampling loop
//!
//! Drives the active integrator over the truncated schedule, one
//! guidance-aware denoise call per transition, with an optional
//! per-step observer. Compositing and decoding are separate phases
//! owned by the engine; the loop itself only moves the latent.

use burn::prelude::*;
use rand::rngs::StdRng;

use burn_diffuse_samplers::Integrator;

use crate::denoise::GuidedDenoiser;

/// Where a generation run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplePhase {
    NotStarted,
    /// Executing denoise transition `step` of `total`
    Running { step: usize, total: usize },
    /// Blending the protected region back in (standard-model inpaint)
    InpaintComposite,
    Decoding,
    Done,
}

/// Snapshot handed to the per-step observer after each transition
pub struct StepInfo<'a, B: Backend> {
    /// Index of the transition just completed
    pub step: usize,
    /// Total transitions in the (truncated) schedule
    pub total: usize,
    /// Noise level the transition was conditioned on
    pub noise_level: f32,
    /// Latent after the transition
    pub latent: &'a Tensor<B, 4>,
}

/// Observer verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutput {
    Continue,
    /// Abort the loop; the current latent becomes the result
    Stop,
}

/// Per-step observer callback
pub type StepCallback<'a, B> = dyn FnMut(StepInfo<'_, B>) -> StepOutput + 'a;

/// Run the denoise transitions from `offset` to the end of the schedule.
///
/// Every scheduled transition executes in order; `offset` resumes a
/// strength-truncated schedule part-way through. Exactly one guided
/// prediction happens per transition (the midpoint method issues its
/// extra evaluation through the integrator itself).
pub fn denoise_loop<B: Backend>(
    integrator: &mut dyn Integrator<B>,
    model: &mut GuidedDenoiser<'_, B>,
    mut latent: Tensor<B, 4>,
    offset: usize,
    rng: &mut StdRng,
    mut on_step: Option<&mut StepCallback<'_, B>>,
) -> Tensor<B, 4> {
    let total = integrator.num_steps();
    let mut predict = |x: Tensor<B, 4>, noise_level: f32| model.predict(x, noise_level);

    for step in offset..total {
        let noise_level = integrator.noise_level(step);
        let noise_pred = predict(latent.clone(), noise_level);
        latent = integrator.advance(latent, noise_pred, step, &mut predict, rng);

        if let Some(observer) = on_step.as_deref_mut() {
            let info = StepInfo {
                step,
                total,
                noise_level,
                latent: &latent,
            };
            if observer(info) == StepOutput::Stop {
                break;
            }
        }
    }
    latent
}
