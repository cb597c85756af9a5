//! Trajectory inversion
//!
//! Walks the residual schedule in ascending order, re-noising a clean
//! latent along the deterministic trajectory so a later forward pass
//! with the same conditioning reconstructs it. Only the closed-form
//! residual family supports this; the ODE family falls back to
//! stochastic re-noising via `add_noise`.

use burn::prelude::*;

use burn_diffuse_samplers::ResidualIntegrator;

use crate::config::DebugConfig;
use crate::models::EngineModels;
use crate::offload::DeviceArbiter;
use crate::stats::trap_non_finite_if;

/// Invert a clean latent to the noisy end of the schedule.
///
/// `conditioning` is a single block (no guidance expansion); a control
/// hint, when present, injects its residuals exactly as during forward
/// sampling.
pub fn invert_latent<B: Backend>(
    integrator: &ResidualIntegrator<B>,
    models: &mut EngineModels<B>,
    arbiter: DeviceArbiter,
    mut latent: Tensor<B, 4>,
    conditioning: Tensor<B, 3>,
    control_hint: Option<&Tensor<B, 4>>,
    control_scale: f32,
    debug: DebugConfig,
) -> Tensor<B, 4> {
    // ascending timesteps: least noisy first
    for &t in integrator.timesteps().iter().rev() {
        let residuals = match (control_hint, models.control_net.as_mut()) {
            (Some(hint), Some(control_net)) => {
                let hint = hint
                    .clone()
                    .repeat_dim(0, latent.dims()[0] / hint.dims()[0]);
                let residuals = {
                    let control_net = arbiter.lease(&mut **control_net);
                    control_net.forward(latent.clone(), t as f32, conditioning.clone(), hint)
                };
                Some(residuals.scaled(control_scale))
            }
            _ => None,
        };

        let noise_pred = {
            let denoiser = arbiter.lease(&mut *models.denoiser);
            denoiser.forward(
                latent.clone(),
                t as f32,
                conditioning.clone(),
                residuals.as_ref(),
            )
        };
        trap_non_finite_if(&noise_pred, "inversion noise estimate", debug.nan);

        latent = integrator.invert_step(noise_pred, t, latent);
    }
    latent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Component, ControlResiduals, Denoiser, DiagonalGaussian, VaeCodec};
    use burn_diffuse_samplers::{DdimConfig, NoiseSchedule};

    type B = burn_ndarray::NdArray<f32>;

    /// Constant noise estimate, independent of the sample
    struct ConstantDenoiser(f32);

    impl Component for ConstantDenoiser {}
    impl Denoiser<B> for ConstantDenoiser {
        fn in_channels(&self) -> usize {
            4
        }
        fn forward(
            &self,
            latent: Tensor<B, 4>,
            _timestep: f32,
            _conditioning: Tensor<B, 3>,
            _residuals: Option<&ControlResiduals<B>>,
        ) -> Tensor<B, 4> {
            latent.zeros_like() + self.0
        }
    }

    struct IdentityVae;
    impl Component for IdentityVae {}
    impl VaeCodec<B> for IdentityVae {
        fn encode(&self, pixels: Tensor<B, 4>) -> DiagonalGaussian<B> {
            DiagonalGaussian {
                std: pixels.zeros_like(),
                mean: pixels,
            }
        }
        fn decode(&self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
            latent
        }
    }

    #[test]
    fn test_inversion_visits_whole_schedule_ascending() {
        let schedule = NoiseSchedule::sd();
        let steps = 10;
        let integrator = ResidualIntegrator::<B>::new(
            schedule.clone(),
            schedule.spaced_timesteps(steps),
            DdimConfig {
                num_inference_steps: steps,
                eta: 0.0,
            },
        );
        let mut models = EngineModels::new(
            Box::new(ConstantDenoiser(0.1)),
            Box::new(IdentityVae),
        );
        let latent = Tensor::<B, 4>::ones([1, 4, 4, 4], &Default::default());
        let inverted = invert_latent(
            &integrator,
            &mut models,
            DeviceArbiter::new(false),
            latent.clone(),
            Tensor::zeros([1, 2, 4], &Default::default()),
            None,
            1.0,
            DebugConfig::default(),
        );
        // ended at the noisy end of the schedule, away from the input
        let moved = inverted.sub(latent).abs().max().into_scalar();
        assert!(moved > 1e-3);
    }
}
