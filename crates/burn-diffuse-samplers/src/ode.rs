//! Continuous-sigma integrator family
//!
//! Covers the external ODE samplers the engine exposes: Euler, ancestral
//! Euler, linear multistep (order 4), and second-order ancestral. All of
//! them consume the combined noise estimate as the derivative
//! `d = (x - denoised) / sigma` and advance one sigma interval.

use burn::prelude::*;
use rand::rngs::StdRng;

use crate::integrator::{sealed, GuidedModel, Integrator};
use crate::noise::randn_like;

/// Which ODE method advances the latent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdeMethod {
    /// Plain Euler step
    Euler,
    /// Euler with ancestral noise injection
    EulerAncestral,
    /// Linear multistep (Adams-Bashforth style), order 4
    Lms,
    /// Second-order ancestral (midpoint model re-evaluation)
    Dpm2Ancestral,
}

/// Maximum derivative history kept for the multistep method
const LMS_ORDER: usize = 4;

/// Number of trapezoid slices for the multistep coefficient quadrature
const LMS_QUAD_SLICES: usize = 64;

/// Continuous-sigma integrator
///
/// Owns the (possibly strength-truncated) sigma sequence, descending and
/// ending at 0.0, plus whatever per-run state the method needs.
pub struct OdeIntegrator<B: Backend> {
    method: OdeMethod,
    sigmas: Vec<f32>,
    /// Derivative history for the multistep method, most recent last
    history: Vec<Tensor<B, 4>>,
}

impl<B: Backend> OdeIntegrator<B> {
    /// Create an integrator over an already-truncated sigma sequence
    pub fn new(method: OdeMethod, sigmas: Vec<f32>) -> Self {
        Self {
            method,
            sigmas,
            history: Vec::new(),
        }
    }

    /// The active sigma sequence (terminal 0 included)
    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    fn euler(
        &self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        sigma: f32,
        sigma_next: f32,
    ) -> Tensor<B, 4> {
        // d = (x - denoised) / sigma collapses to the noise estimate
        latent + noise_pred * (sigma_next - sigma)
    }

    fn euler_ancestral(
        &self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        sigma: f32,
        sigma_next: f32,
        rng: &mut StdRng,
    ) -> Tensor<B, 4> {
        if sigma_next == 0.0 {
            // last transition: pure denoise
            return latent - noise_pred * sigma;
        }
        let (sigma_down, sigma_up) = ancestral_split(sigma, sigma_next);
        let stepped = latent + noise_pred * (sigma_down - sigma);
        stepped.clone() + randn_like(&stepped, rng) * sigma_up
    }

    fn lms(
        &mut self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        step: usize,
    ) -> Tensor<B, 4> {
        self.history.push(noise_pred);
        if self.history.len() > LMS_ORDER {
            self.history.remove(0);
        }

        let order = self.history.len();
        let mut out = latent;
        for (j, d) in self.history.iter().rev().enumerate() {
            let coeff = lms_coefficient(&self.sigmas, order, step, j);
            out = out + d.clone() * coeff;
        }
        out
    }

    fn dpm2_ancestral(
        &self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        sigma: f32,
        sigma_next: f32,
        model: &mut dyn GuidedModel<B>,
        rng: &mut StdRng,
    ) -> Tensor<B, 4> {
        let (sigma_down, sigma_up) = if sigma_next == 0.0 {
            (0.0, 0.0)
        } else {
            ancestral_split(sigma, sigma_next)
        };

        let stepped = if sigma_down == 0.0 {
            latent + noise_pred * (sigma_down - sigma)
        } else {
            // midpoint in cube-root sigma space, second model evaluation
            let sigma_mid =
                ((sigma.powf(1.0 / 3.0) + sigma_down.powf(1.0 / 3.0)) / 2.0).powi(3);
            let mid = latent.clone() + noise_pred * (sigma_mid - sigma);
            let noise_mid = model.predict(mid, sigma_mid);
            latent + noise_mid * (sigma_down - sigma)
        };

        if sigma_up > 0.0 {
            stepped.clone() + randn_like(&stepped, rng) * sigma_up
        } else {
            stepped
        }
    }
}

/// Split one ancestral transition into a deterministic step and a noise
/// re-injection level
fn ancestral_split(sigma_from: f32, sigma_to: f32) -> (f32, f32) {
    let sigma_up =
        (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2)) / sigma_from.powi(2)).sqrt();
    let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).max(0.0).sqrt();
    (sigma_down, sigma_up)
}

/// Integrated Lagrange-basis coefficient for the multistep method.
///
/// Integrates the basis polynomial for history entry `j` over the sigma
/// interval of `step` by fixed trapezoid quadrature.
fn lms_coefficient(sigmas: &[f32], order: usize, step: usize, j: usize) -> f32 {
    let a = sigmas[step] as f64;
    let b = sigmas[step + 1] as f64;
    let basis = |x: f64| -> f64 {
        let mut prod = 1.0;
        for k in 0..order {
            if k == j {
                continue;
            }
            let s_j = sigmas[step - j] as f64;
            let s_k = sigmas[step - k] as f64;
            prod *= (x - s_k) / (s_j - s_k);
        }
        prod
    };

    let h = (b - a) / LMS_QUAD_SLICES as f64;
    let mut acc = (basis(a) + basis(b)) / 2.0;
    for i in 1..LMS_QUAD_SLICES {
        acc += basis(a + h * i as f64);
    }
    (acc * h) as f32
}

impl<B: Backend> sealed::Sealed for OdeIntegrator<B> {}

impl<B: Backend> Integrator<B> for OdeIntegrator<B> {
    fn noise_level(&self, step: usize) -> f32 {
        self.sigmas[step]
    }

    fn num_steps(&self) -> usize {
        self.sigmas.len().saturating_sub(1)
    }

    fn advance(
        &mut self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        step: usize,
        model: &mut dyn GuidedModel<B>,
        rng: &mut StdRng,
    ) -> Tensor<B, 4> {
        let sigma = self.sigmas[step];
        let sigma_next = self.sigmas[step + 1];
        match self.method {
            OdeMethod::Euler => self.euler(latent, noise_pred, sigma, sigma_next),
            OdeMethod::EulerAncestral => {
                self.euler_ancestral(latent, noise_pred, sigma, sigma_next, rng)
            }
            OdeMethod::Lms => self.lms(latent, noise_pred, step),
            OdeMethod::Dpm2Ancestral => {
                self.dpm2_ancestral(latent, noise_pred, sigma, sigma_next, model, rng)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    type B = burn_ndarray::NdArray<f32>;

    fn noop_model(_x: Tensor<B, 4>, _s: f32) -> Tensor<B, 4> {
        panic!("model must not be consulted by single-evaluation methods")
    }

    #[test]
    fn test_euler_closed_form() {
        let device = Default::default();
        let mut it = OdeIntegrator::<B>::new(OdeMethod::Euler, vec![2.0, 1.0, 0.0]);
        let latent = Tensor::<B, 4>::ones([1, 4, 2, 2], &device);
        let eps = Tensor::<B, 4>::ones([1, 4, 2, 2], &device) * 0.5;

        let mut model = noop_model;
        let out = it.advance(latent, eps, 0, &mut model, &mut StdRng::seed_from_u64(0));
        // x + eps * (1.0 - 2.0) = 1 - 0.5
        let err = (out - 0.5).abs().max().into_scalar();
        assert!(err < 1e-6);
    }

    #[test]
    fn test_euler_terminal_reaches_denoised() {
        let device = Default::default();
        let mut it = OdeIntegrator::<B>::new(OdeMethod::Euler, vec![1.5, 0.0]);
        let latent = Tensor::<B, 4>::ones([1, 4, 2, 2], &device) * 2.0;
        let eps = Tensor::<B, 4>::ones([1, 4, 2, 2], &device);

        let mut model = noop_model;
        let out = it.advance(
            latent.clone(),
            eps.clone(),
            0,
            &mut model,
            &mut StdRng::seed_from_u64(0),
        );
        let denoised = latent - eps * 1.5;
        let err = (out - denoised).abs().max().into_scalar();
        assert!(err < 1e-6);
    }

    #[test]
    fn test_ancestral_split_magnitudes() {
        let (down, up) = ancestral_split(2.0, 1.0);
        assert!(down > 0.0 && up > 0.0);
        // recombined variance matches the target level
        assert!(((down * down + up * up).sqrt() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_lms_order_one_matches_euler() {
        let device = Default::default();
        let sigmas = vec![3.0, 2.0, 1.0, 0.0];
        let mut lms = OdeIntegrator::<B>::new(OdeMethod::Lms, sigmas.clone());
        let mut euler = OdeIntegrator::<B>::new(OdeMethod::Euler, sigmas);
        let latent = Tensor::<B, 4>::ones([1, 4, 2, 2], &device);
        let eps = Tensor::<B, 4>::ones([1, 4, 2, 2], &device) * 0.3;

        // with an empty history the multistep coefficient integrates a
        // constant basis, which is exactly the Euler increment
        let mut model = noop_model;
        let a = lms.advance(
            latent.clone(),
            eps.clone(),
            0,
            &mut model,
            &mut StdRng::seed_from_u64(0),
        );
        let b = euler.advance(latent, eps, 0, &mut model, &mut StdRng::seed_from_u64(0));
        let err = (a - b).abs().max().into_scalar();
        assert!(err < 1e-5);
    }

    #[test]
    fn test_dpm2_ancestral_consults_model_at_midpoint() {
        let device = Default::default();
        let mut it = OdeIntegrator::<B>::new(OdeMethod::Dpm2Ancestral, vec![2.0, 1.0, 0.0]);
        let latent = Tensor::<B, 4>::zeros([1, 4, 2, 2], &device);
        let eps = Tensor::<B, 4>::ones([1, 4, 2, 2], &device) * 0.1;

        let mut calls = 0usize;
        let mut model = |x: Tensor<B, 4>, _sigma: f32| {
            calls += 1;
            x * 0.0
        };
        let _ = it.advance(latent, eps, 0, &mut model, &mut StdRng::seed_from_u64(0));
        assert_eq!(calls, 1);
    }
}
