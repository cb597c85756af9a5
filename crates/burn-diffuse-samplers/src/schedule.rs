//! Noise schedules for diffusion sampling
//!
//! Holds the full training schedule (cumulative alpha products) and
//! derives the active per-run subset: spaced inference timesteps for the
//! residual family, or a descending sigma sequence for the ODE family,
//! truncated by a strength fraction so that sampling always ends at the
//! fully-denoised terminal state.

/// Noise schedule configuration
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Number of training timesteps
    pub num_train_steps: usize,
    /// First beta of the scaled-linear ramp
    pub beta_start: f64,
    /// Last beta of the scaled-linear ramp
    pub beta_end: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            num_train_steps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
        }
    }
}

/// Precomputed training schedule values
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    /// Cumulative product of alphas, one per training timestep
    alphas_cumprod: Vec<f32>,
    /// Number of training steps
    pub num_train_steps: usize,
}

impl NoiseSchedule {
    /// Create a scaled-linear beta schedule (betas linear in sqrt space)
    pub fn scaled_linear(config: &ScheduleConfig) -> Self {
        let n = config.num_train_steps;
        let sqrt_start = config.beta_start.sqrt();
        let sqrt_end = config.beta_end.sqrt();

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut cumprod = 1.0f64;
        for i in 0..n {
            let t = i as f64 / (n - 1) as f64;
            let beta = (sqrt_start + t * (sqrt_end - sqrt_start)).powi(2);
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod as f32);
        }

        Self {
            alphas_cumprod,
            num_train_steps: n,
        }
    }

    /// The default Stable Diffusion training schedule
    pub fn sd() -> Self {
        Self::scaled_linear(&ScheduleConfig::default())
    }

    /// Cumulative alpha at a training timestep
    pub fn alpha_cumprod_at(&self, t: usize) -> f32 {
        self.alphas_cumprod[t.min(self.num_train_steps - 1)]
    }

    /// Cumulative alpha for the step *before* the trajectory starts.
    ///
    /// Used by the closed-form update when stepping past timestep 0.
    pub fn final_alpha_cumprod(&self) -> f32 {
        1.0
    }

    /// Noise level sigma at a training timestep: sqrt((1 - a) / a)
    pub fn sigma_at(&self, t: usize) -> f32 {
        let a = self.alpha_cumprod_at(t);
        ((1.0 - a) / a).sqrt()
    }

    /// Evenly spaced inference timesteps, descending
    pub fn spaced_timesteps(&self, num_inference_steps: usize) -> Vec<usize> {
        let step_ratio = self.num_train_steps / num_inference_steps;
        (0..num_inference_steps).rev().map(|i| i * step_ratio).collect()
    }

    /// Descending sigma sequence for the ODE family, terminal 0 appended
    pub fn spaced_sigmas(&self, num_inference_steps: usize) -> Vec<f32> {
        let mut sigmas: Vec<f32> = self
            .spaced_timesteps(num_inference_steps)
            .into_iter()
            .map(|t| self.sigma_at(t))
            .collect();
        sigmas.push(0.0);
        sigmas
    }

    /// Map a sigma back to a (fractional) training timestep.
    ///
    /// Linear interpolation in log-sigma space, the same conversion the
    /// k-diffusion wrapper applies before conditioning the denoiser.
    pub fn timestep_for_sigma(&self, sigma: f32) -> f32 {
        if sigma <= 0.0 {
            return 0.0;
        }
        let log_sigma = sigma.ln();

        // log-sigmas ascend with t, so scan for the bracketing pair
        let mut low = 0usize;
        let mut high = self.num_train_steps - 1;
        if log_sigma <= self.sigma_at(0).ln() {
            return 0.0;
        }
        if log_sigma >= self.sigma_at(high).ln() {
            return high as f32;
        }
        while high - low > 1 {
            let mid = (low + high) / 2;
            if self.sigma_at(mid).ln() <= log_sigma {
                low = mid;
            } else {
                high = mid;
            }
        }

        let ls_low = self.sigma_at(low).ln();
        let ls_high = self.sigma_at(high).ln();
        let w = (log_sigma - ls_low) / (ls_high - ls_low);
        low as f32 + w
    }
}

/// The active per-run schedule, fixed once at setup
///
/// One of two mutually exclusive representations; the engine never mixes
/// them within one run. `len()` counts denoise transitions, so for both
/// families the sampling loop performs exactly `len() - offset` denoise
/// calls.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Discrete timestep indices, descending (residual family)
    Timesteps(Vec<usize>),
    /// Noise sigmas, descending, ending at 0.0 (ODE family)
    Sigmas(Vec<f32>),
}

impl Schedule {
    /// Number of denoise transitions in this schedule
    pub fn len(&self) -> usize {
        match self {
            Schedule::Timesteps(ts) => ts.len(),
            Schedule::Sigmas(sigmas) => sigmas.len().saturating_sub(1),
        }
    }

    /// True when no denoise call would run
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The noise level the starting latent should carry.
    ///
    /// 1.0 for the residual family (unit-variance noise), the leading
    /// sigma for the ODE family.
    pub fn init_noise_scale(&self) -> f32 {
        match self {
            Schedule::Timesteps(_) => 1.0,
            Schedule::Sigmas(sigmas) => sigmas.first().copied().unwrap_or(0.0),
        }
    }

    /// First timestep of the truncated trajectory, if the residual
    /// representation is active. Used for stochastic re-noising.
    pub fn first_timestep(&self) -> Option<usize> {
        match self {
            Schedule::Timesteps(ts) => ts.first().copied(),
            Schedule::Sigmas(_) => None,
        }
    }
}

/// Number of steps actually executed for a strength fraction
pub fn effective_steps(total_steps: usize, strength: f64) -> usize {
    ((total_steps as f64 * strength).round() as usize).min(total_steps)
}

/// Truncate a full descending timestep sequence by strength.
///
/// Keeps the **last** `effective + warmup` entries: sampling always ends
/// at the fully-denoised terminal state but may start partway through
/// when strength < 1 (image-to-image).
pub fn truncate_timesteps(
    timesteps: &[usize],
    total_steps: usize,
    strength: f64,
    warmup: usize,
) -> Vec<usize> {
    let keep = (effective_steps(total_steps, strength) + warmup).min(timesteps.len());
    timesteps[timesteps.len() - keep..].to_vec()
}

/// Truncate a sigma sequence (with terminal 0) the same way
pub fn truncate_sigmas(
    sigmas: &[f32],
    total_steps: usize,
    strength: f64,
    warmup: usize,
) -> Vec<f32> {
    let keep = (effective_steps(total_steps, strength) + warmup + 1).min(sigmas.len());
    sigmas[sigmas.len() - keep..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spaced_timesteps() {
        let schedule = NoiseSchedule::sd();
        let steps = schedule.spaced_timesteps(50);
        assert_eq!(steps.len(), 50);
        assert_eq!(steps[0], 980); // highest noise first
        assert_eq!(steps[49], 0);
    }

    #[test]
    fn test_alphas_monotonic() {
        let schedule = NoiseSchedule::sd();
        for t in 1..schedule.num_train_steps {
            assert!(schedule.alpha_cumprod_at(t) < schedule.alpha_cumprod_at(t - 1));
        }
        assert!(schedule.alpha_cumprod_at(0) < 1.0);
    }

    #[test]
    fn test_sigmas_descend_and_terminate() {
        let schedule = NoiseSchedule::sd();
        let sigmas = schedule.spaced_sigmas(30);
        assert_eq!(sigmas.len(), 31);
        assert_eq!(*sigmas.last().unwrap(), 0.0);
        for pair in sigmas.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn test_effective_steps_rounds() {
        assert_eq!(effective_steps(50, 1.0), 50);
        assert_eq!(effective_steps(50, 0.6), 30);
        assert_eq!(effective_steps(50, 0.605), 30);
        assert_eq!(effective_steps(50, 1.5), 50); // capped
    }

    #[test]
    fn test_truncation_keeps_tail() {
        let schedule = NoiseSchedule::sd();
        let ts = schedule.spaced_timesteps(50);
        let cut = truncate_timesteps(&ts, 50, 0.6, 1);
        assert_eq!(cut.len(), 31); // 30 effective + 1 warmup
        assert_eq!(*cut.last().unwrap(), 0); // still ends fully denoised
        assert_eq!(cut, ts[50 - 31..].to_vec());
    }

    #[test]
    fn test_truncation_full_strength_capped() {
        let schedule = NoiseSchedule::sd();
        let ts = schedule.spaced_timesteps(50);
        let cut = truncate_timesteps(&ts, 50, 1.0, 1);
        assert_eq!(cut.len(), 50); // cannot exceed the full schedule
    }

    #[test]
    fn test_schedule_len_counts_transitions() {
        let schedule = NoiseSchedule::sd();
        let residual = Schedule::Timesteps(schedule.spaced_timesteps(30));
        let ode = Schedule::Sigmas(schedule.spaced_sigmas(30));
        assert_eq!(residual.len(), 30);
        assert_eq!(ode.len(), 30);
    }

    #[test]
    fn test_sigma_timestep_roundtrip() {
        let schedule = NoiseSchedule::sd();
        for &t in &[1usize, 100, 500, 980] {
            let sigma = schedule.sigma_at(t);
            let back = schedule.timestep_for_sigma(sigma);
            assert!(
                (back - t as f32).abs() < 0.5,
                "t={} sigma={} back={}",
                t,
                sigma,
                back
            );
        }
    }
}
