//! The sealed integrator interface
//!
//! The sampling loop is written once against [`Integrator`]; the two
//! implementations are [`crate::ResidualIntegrator`] (discrete-timestep
//! closed form) and [`crate::OdeIntegrator`] (continuous-sigma family).

use burn::prelude::*;
use rand::rngs::StdRng;

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Noise-prediction seam handed to integrators.
///
/// Wraps the guidance-aware denoise step as `(x, noise level) -> epsilon`
/// so higher-order methods can re-evaluate the model at intermediate
/// noise levels (DPM2 ancestral needs a midpoint estimate).
pub trait GuidedModel<B: Backend> {
    /// Predict the combined noise estimate for `latent` at `noise_level`
    /// (a sigma for the ODE family, a timestep for the residual family).
    fn predict(&mut self, latent: Tensor<B, 4>, noise_level: f32) -> Tensor<B, 4>;
}

impl<B: Backend, F: FnMut(Tensor<B, 4>, f32) -> Tensor<B, 4>> GuidedModel<B> for F {
    fn predict(&mut self, latent: Tensor<B, 4>, noise_level: f32) -> Tensor<B, 4> {
        self(latent, noise_level)
    }
}

/// One-step advance over either integrator family.
///
/// `advance` consumes the combined noise estimate the loop already
/// computed for this step and returns the next (less noisy) latent.
/// Implementations may hold multistep history; the loop owns nothing
/// but the latent.
pub trait Integrator<B: Backend>: sealed::Sealed {
    /// The noise level the denoiser should be conditioned on at `step`
    fn noise_level(&self, step: usize) -> f32;

    /// Number of denoise transitions this integrator will run
    fn num_steps(&self) -> usize;

    /// Advance the latent one step using the precomputed noise estimate.
    ///
    /// `model` is consulted only by methods that need additional
    /// evaluations within the step; `rng` only by stochastic variants.
    fn advance(
        &mut self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        step: usize,
        model: &mut dyn GuidedModel<B>,
        rng: &mut StdRng,
    ) -> Tensor<B, 4>;
}
