//! Residual-family integrator (DDIM closed form)
//!
//! One-step update rule over discrete timestep indices, with an optional
//! eta stochasticity term (0.0 = deterministic). Also carries the
//! forward-noising rule and the closed-form inverse step used by
//! trajectory inversion.

use std::marker::PhantomData;

use burn::prelude::*;
use rand::rngs::StdRng;

use crate::integrator::{sealed, GuidedModel, Integrator};
use crate::noise::randn_like;
use crate::schedule::NoiseSchedule;

/// Residual integrator configuration
#[derive(Debug, Clone)]
pub struct DdimConfig {
    /// Number of inference steps the full (untruncated) schedule spans
    pub num_inference_steps: usize,
    /// Stochasticity parameter (0.0 = deterministic DDIM, 1.0 = DDPM-like)
    pub eta: f64,
}

impl Default for DdimConfig {
    fn default() -> Self {
        Self {
            num_inference_steps: 50,
            eta: 0.0,
        }
    }
}

/// Discrete-timestep integrator
///
/// Owns the (possibly strength-truncated) timestep sequence for the run;
/// the sampling loop reads noise levels from it and hands back one
/// combined noise estimate per step.
pub struct ResidualIntegrator<B: Backend> {
    schedule: NoiseSchedule,
    config: DdimConfig,
    timesteps: Vec<usize>,
    _backend: PhantomData<B>,
}

impl<B: Backend> ResidualIntegrator<B> {
    /// Create an integrator over an already-truncated timestep sequence
    pub fn new(schedule: NoiseSchedule, timesteps: Vec<usize>, config: DdimConfig) -> Self {
        Self {
            schedule,
            config,
            timesteps,
            _backend: PhantomData,
        }
    }

    /// The active timestep sequence
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Spacing between consecutive inference timesteps
    fn step_ratio(&self) -> usize {
        self.schedule.num_train_steps / self.config.num_inference_steps
    }

    /// Forward-noise a clean latent to timestep `t`
    pub fn add_noise(
        &self,
        latent: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        t: usize,
    ) -> Tensor<B, 4> {
        let a = self.schedule.alpha_cumprod_at(t);
        latent * a.sqrt() + noise * (1.0 - a).sqrt()
    }

    /// One DDIM step: current latent + noise estimate -> previous latent
    pub fn step(
        &self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        step_index: usize,
        rng: &mut StdRng,
    ) -> Tensor<B, 4> {
        let t = self.timesteps[step_index];
        let alpha_t = self.schedule.alpha_cumprod_at(t);
        let alpha_prev = if step_index + 1 < self.timesteps.len() {
            self.schedule.alpha_cumprod_at(self.timesteps[step_index + 1])
        } else {
            self.schedule.final_alpha_cumprod()
        };

        // pred_x0 = (x - sqrt(1-a_t) * eps) / sqrt(a_t)
        let pred_x0 =
            (latent - noise_pred.clone() * (1.0 - alpha_t).sqrt()) / alpha_t.sqrt();

        let sigma = if self.config.eta > 0.0 {
            let variance =
                (1.0 - alpha_prev) / (1.0 - alpha_t) * (1.0 - alpha_t / alpha_prev);
            self.config.eta as f32 * variance.max(0.0).sqrt()
        } else {
            0.0
        };

        // direction pointing back to x_t
        let dir_coef = (1.0 - alpha_prev - sigma * sigma).max(0.0).sqrt();
        let mut prev = pred_x0 * alpha_prev.sqrt() + noise_pred * dir_coef;

        if sigma > 0.0 {
            prev = prev.clone() + randn_like(&prev, rng) * sigma;
        }
        prev
    }

    /// Closed-form inverse of the forward step.
    ///
    /// Derives the next-noisier sample at timestep `t` from the current
    /// sample and its noise estimate, using the two adjacent cumulative
    /// alphas. Stepping the result forward with the same estimate
    /// reconstructs `sample` exactly.
    pub fn invert_step(
        &self,
        noise_pred: Tensor<B, 4>,
        t: usize,
        sample: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let t_prev = t as isize - self.step_ratio() as isize;
        let alpha_prev = if t_prev >= 0 {
            self.schedule
                .alpha_cumprod_at((t_prev as usize).min(self.schedule.num_train_steps - 1))
        } else {
            self.schedule.final_alpha_cumprod()
        };
        let alpha_next = self.schedule.alpha_cumprod_at(t);

        let next_x0 =
            (sample - noise_pred.clone() * (1.0 - alpha_prev).sqrt()) / alpha_prev.sqrt();
        next_x0 * alpha_next.sqrt() + noise_pred * (1.0 - alpha_next).sqrt()
    }
}

impl<B: Backend> sealed::Sealed for ResidualIntegrator<B> {}

impl<B: Backend> Integrator<B> for ResidualIntegrator<B> {
    fn noise_level(&self, step: usize) -> f32 {
        self.timesteps[step] as f32
    }

    fn num_steps(&self) -> usize {
        self.timesteps.len()
    }

    fn advance(
        &mut self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        step: usize,
        _model: &mut dyn GuidedModel<B>,
        rng: &mut StdRng,
    ) -> Tensor<B, 4> {
        self.step(latent, noise_pred, step, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    type B = burn_ndarray::NdArray<f32>;

    fn integrator(steps: usize) -> ResidualIntegrator<B> {
        let schedule = NoiseSchedule::sd();
        let timesteps = schedule.spaced_timesteps(steps);
        ResidualIntegrator::new(
            schedule,
            timesteps,
            DdimConfig {
                num_inference_steps: steps,
                eta: 0.0,
            },
        )
    }

    #[test]
    fn test_step_deterministic_without_eta() {
        let device = Default::default();
        let it = integrator(10);
        let latent = Tensor::<B, 4>::ones([1, 4, 8, 8], &device);
        let noise = Tensor::<B, 4>::ones([1, 4, 8, 8], &device) * 0.1;

        let a = it.step(latent.clone(), noise.clone(), 3, &mut StdRng::seed_from_u64(0));
        let b = it.step(latent, noise, 3, &mut StdRng::seed_from_u64(99));
        let diff = (a - b).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_invert_then_step_roundtrips() {
        let device = Default::default();
        let it = integrator(10);
        let sample = Tensor::<B, 4>::ones([1, 4, 8, 8], &device) * 0.5;
        let eps = Tensor::<B, 4>::ones([1, 4, 8, 8], &device) * 0.2;

        // Invert from the last scheduled timestep, then step forward
        // from the same position with the same noise estimate.
        let step_index = it.timesteps().len() - 1;
        let t = it.timesteps()[step_index];
        let noisier = it.invert_step(eps.clone(), t, sample.clone());
        let back = it.step(noisier, eps, step_index, &mut StdRng::seed_from_u64(0));

        let err = (back - sample).abs().max().into_scalar();
        assert!(err < 1e-4, "roundtrip error {}", err);
    }

    #[test]
    fn test_final_step_lands_on_x0() {
        let device = Default::default();
        let it = integrator(10);
        let last = it.timesteps().len() - 1;
        let t = it.timesteps()[last];
        let a = NoiseSchedule::sd().alpha_cumprod_at(t);

        // x constructed as sqrt(a)*x0 + sqrt(1-a)*eps with known parts
        let x0 = Tensor::<B, 4>::ones([1, 4, 4, 4], &device) * 0.3;
        let eps = Tensor::<B, 4>::ones([1, 4, 4, 4], &device) * 0.7;
        let x = x0.clone() * a.sqrt() + eps.clone() * (1.0 - a).sqrt();

        let out = it.step(x, eps, last, &mut StdRng::seed_from_u64(0));
        let err = (out - x0).abs().max().into_scalar();
        assert!(err < 1e-4, "terminal step error {}", err);
    }
}
