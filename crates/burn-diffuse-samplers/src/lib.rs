//! Noise schedules and integrators for latent-diffusion sampling
//!
//! Two structurally different integrator families live here behind one
//! interface: the discrete-timestep residual family (DDIM closed form)
//! and the continuous-sigma ODE family (Euler, ancestral Euler, LMS,
//! DPM2 ancestral). The engine crate drives either through
//! [`Integrator`] without knowing which is active.

pub mod ddim;
pub mod guidance;
pub mod integrator;
pub mod noise;
pub mod ode;
pub mod schedule;

pub use ddim::{DdimConfig, ResidualIntegrator};
pub use guidance::{combine_pixel_edit, combine_weighted, uniform_weights};
pub use integrator::{GuidedModel, Integrator};
pub use noise::{randn, randn_like};
pub use ode::{OdeIntegrator, OdeMethod};
pub use schedule::{
    effective_steps, truncate_sigmas, truncate_timesteps, NoiseSchedule, Schedule, ScheduleConfig,
};
