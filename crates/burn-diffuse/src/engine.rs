//! The sampling engine
//!
//! One instance owns the run configuration, the frozen sub-models, the
//! active schedule and the seeded noise source, and exposes the
//! generation surface: latent preparation, the guided sampling loop,
//! trajectory inversion and decoding.

use std::time::{SystemTime, UNIX_EPOCH};

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use burn_diffuse_samplers::{
    randn, randn_like, truncate_sigmas, truncate_timesteps, DdimConfig, Integrator, NoiseSchedule,
    OdeIntegrator, OdeMethod, ResidualIntegrator, Schedule,
};

use crate::codec::{decode_latent, encode_pixels, replicate_batch, Latent};
use crate::compose::Conditioning;
use crate::config::{BackendCaps, GenConfig, ModelVariant, SamplerKind};
use crate::denoise::{GuidedDenoiser, SideChannels};
use crate::error::EngineError;
use crate::models::EngineModels;
use crate::offload::DeviceArbiter;
use crate::prep::{self, MaskSource, PreparedMask};
use crate::sample::{denoise_loop, SamplePhase, StepCallback};

const LATENT_CHANNELS: usize = 4;
const SCHEDULE_WARMUP: usize = 1;

/// Per-call optional inputs for [`Engine::generate`]
#[derive(Default)]
pub struct SideInputs<B: Backend> {
    /// Prepared inpainting mask pair
    pub mask: Option<PreparedMask<B>>,
    /// Prepared depth conditioning channel
    pub depth: Option<Tensor<B, 4>>,
    /// Control-network hint image, pixel resolution
    pub control_hint: Option<Tensor<B, 4>>,
    /// Edit-source latent for pixel-edit guidance
    pub edit_latent: Option<Tensor<B, 4>>,
    /// Guidance scale override for this call
    pub cfg_scale: Option<f32>,
    /// Resume index into the truncated schedule
    pub offset: usize,
}

/// Latent-diffusion sampling engine
pub struct Engine<B: Backend> {
    config: GenConfig,
    variant: ModelVariant,
    models: EngineModels<B>,
    schedule: NoiseSchedule,
    active: Schedule,
    seed: u64,
    rng: StdRng,
    arbiter: DeviceArbiter,
    phase: SamplePhase,
    device: B::Device,
}

impl<B: Backend> Engine<B> {
    /// Build an engine over already-loaded sub-models.
    ///
    /// All configuration-validity errors surface here, before the first
    /// denoise call.
    pub fn new(
        config: GenConfig,
        variant: ModelVariant,
        models: EngineModels<B>,
        caps: BackendCaps,
        device: B::Device,
    ) -> Result<Self, EngineError> {
        config.validate(
            variant,
            caps,
            models.control_net.is_some(),
            models.offload_capable(),
        )?;

        let expected = variant.denoiser_in_channels();
        let provided = models.denoiser.in_channels();
        if provided != expected {
            return Err(EngineError::ChannelMismatch {
                variant: variant.name(),
                expected,
                provided,
            });
        }

        let arbiter = DeviceArbiter::new(config.lowmem);
        let mut engine = Self {
            schedule: NoiseSchedule::sd(),
            active: Schedule::Timesteps(Vec::new()),
            seed: 0,
            rng: StdRng::seed_from_u64(0),
            arbiter,
            phase: SamplePhase::NotStarted,
            variant,
            models,
            device,
            config,
        };
        engine.set_seed(engine.config.seed);
        engine.set_steps(engine.config.steps, engine.config.strength);
        Ok(engine)
    }

    pub fn config(&self) -> &GenConfig {
        &self.config
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    /// The active (possibly truncated) schedule
    pub fn schedule(&self) -> &Schedule {
        &self.active
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Where the last generation call currently is
    pub fn phase(&self) -> SamplePhase {
        self.phase
    }

    /// Reseed the noise source. `None` derives a seed from the clock's
    /// subsecond fraction.
    pub fn set_seed(&mut self, seed: Option<u64>) {
        self.seed = seed.unwrap_or_else(|| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            (now.subsec_nanos() as f64 / 1e9 * 69696.0) as u64
        });
        self.rng = StdRng::seed_from_u64(self.seed);
    }

    /// Fix the active schedule: `steps` spaced over the training range,
    /// truncated to the strength fraction (image-to-image keeps only
    /// the tail of the trajectory).
    pub fn set_steps(&mut self, steps: usize, strength: f64) {
        self.config.steps = steps;
        self.config.strength = strength;
        self.active = if self.config.sampler.is_ode() {
            let sigmas = self.schedule.spaced_sigmas(steps);
            Schedule::Sigmas(truncate_sigmas(&sigmas, steps, strength, SCHEDULE_WARMUP))
        } else {
            let timesteps = self.schedule.spaced_timesteps(steps);
            Schedule::Timesteps(truncate_timesteps(
                &timesteps,
                steps,
                strength,
                SCHEDULE_WARMUP,
            ))
        };
        if self.config.debug.sampler {
            eprintln!(
                "schedule: {} x {} transitions (strength {:.2})",
                self.config.sampler.name(),
                self.active.len(),
                strength
            );
        }
    }

    /// Encode pixels to a scaled latent, replicated across the batch.
    ///
    /// `deterministic` takes the posterior mean instead of sampling.
    pub fn encode_image(&mut self, pixels: Tensor<B, 4>, deterministic: bool) -> Tensor<B, 4> {
        let noise = if deterministic {
            None
        } else {
            let [b, _, h, w] = pixels.dims();
            Some(randn(
                [
                    b,
                    LATENT_CHANNELS,
                    h / self.config.vae_scale,
                    w / self.config.vae_scale,
                ],
                &mut self.rng,
                &self.device,
            ))
        };
        let lat = {
            let vae = self.arbiter.lease(&mut *self.models.vae);
            encode_pixels(&*vae, pixels, self.config.latent_scale_factor, noise)
        };
        replicate_batch(lat, self.config.batch)
    }

    /// Stochastic re-noise of a clean latent to the start of the
    /// truncated trajectory (the fast image-to-image entry).
    pub fn add_noise(&mut self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
        let noise = randn_like(&latent, &mut self.rng);
        match &self.active {
            Schedule::Sigmas(_) => latent + noise * self.active.init_noise_scale(),
            Schedule::Timesteps(_) => {
                let t = self.active.first_timestep().unwrap_or(0);
                let a = self.schedule.alpha_cumprod_at(t);
                latent * a.sqrt() + noise * (1.0 - a).sqrt()
            }
        }
    }

    /// Fresh noise latent at the schedule's initial noise level.
    /// `frames` switches to the spatio-temporal (video) layout.
    pub fn random_latent(
        &mut self,
        height: usize,
        width: usize,
        frames: Option<usize>,
    ) -> Latent<B> {
        let b = self.config.batch;
        let h = height / self.config.vae_scale;
        let w = width / self.config.vae_scale;
        let scale = self.active.init_noise_scale();
        match frames {
            None => Latent::Image(
                randn([b, LATENT_CHANNELS, h, w], &mut self.rng, &self.device) * scale,
            ),
            Some(f) => Latent::Video(
                randn([b, LATENT_CHANNELS, f, h, w], &mut self.rng, &self.device) * scale,
            ),
        }
    }

    /// Resolve a mask and encode the protected source region.
    pub fn prepare_mask(
        &mut self,
        source: MaskSource<B>,
        image: &Tensor<B, 4>,
        invert: bool,
    ) -> Result<PreparedMask<B>, EngineError> {
        let [b, _, h, w] = image.dims();
        let noise = randn(
            [
                b,
                LATENT_CHANNELS,
                h / self.config.vae_scale,
                w / self.config.vae_scale,
            ],
            &mut self.rng,
            &self.device,
        );
        let vae = self.arbiter.lease(&mut *self.models.vae);
        prep::prepare_mask(
            source,
            image,
            invert,
            self.models.segmenter.as_deref(),
            &*vae,
            self.config.latent_scale_factor,
            self.config.vae_scale,
            Some(noise),
        )
    }

    /// Estimate and normalize the depth conditioning channel.
    pub fn prepare_depth(&mut self, image: &Tensor<B, 4>) -> Result<Tensor<B, 4>, EngineError> {
        let estimator = self
            .models
            .depth_estimator
            .as_mut()
            .ok_or(EngineError::DepthEstimatorMissing)?;
        let estimator = self.arbiter.lease(&mut **estimator);
        Ok(prep::prepare_depth(image, &*estimator, self.config.vae_scale))
    }

    /// Deterministic trajectory inversion over the full schedule.
    ///
    /// Residual family only; a forward pass from the result with the
    /// same single-block conditioning reconstructs the input.
    pub fn invert(
        &mut self,
        latent: Tensor<B, 4>,
        conditioning: Tensor<B, 3>,
        control_hint: Option<&Tensor<B, 4>>,
    ) -> Result<Tensor<B, 4>, EngineError> {
        if self.config.sampler.is_ode() {
            return Err(EngineError::InversionUnsupported);
        }
        let integrator = ResidualIntegrator::<B>::new(
            self.schedule.clone(),
            self.schedule.spaced_timesteps(self.config.steps),
            DdimConfig {
                num_inference_steps: self.config.steps,
                eta: 0.0,
            },
        );
        Ok(crate::invert::invert_latent(
            &integrator,
            &mut self.models,
            self.arbiter,
            latent,
            conditioning,
            control_hint,
            self.config.control_scale,
            self.config.debug,
        ))
    }

    /// Run the guided sampling loop and decode the result to pixels.
    pub fn generate(
        &mut self,
        latent: Latent<B>,
        conditioning: &Conditioning<B>,
        side: SideInputs<B>,
        on_step: Option<&mut StepCallback<'_, B>>,
    ) -> Result<Latent<B>, EngineError> {
        if self.variant == ModelVariant::Inpaint && side.mask.is_none() {
            return Err(EngineError::MaskRequired);
        }
        if side.control_hint.is_some() && self.models.control_net.is_none() {
            return Err(EngineError::ControlNetMissing);
        }
        self.phase = SamplePhase::NotStarted;

        let cfg_scale = side.cfg_scale.unwrap_or(self.config.cfg_scale);
        let pixel_edit = self.config.img_scale.is_some() && side.edit_latent.is_some();

        let (folded, frames) = latent.fold();
        let rows = folded.dims()[0];
        // conditioning rides along every folded latent row (video folds
        // its frame axis into the batch)
        let (conds, mode) = conditioning.compose(cfg_scale, pixel_edit, rows);

        let mut integrator: Box<dyn Integrator<B>> = match &self.active {
            Schedule::Timesteps(timesteps) => Box::new(ResidualIntegrator::<B>::new(
                self.schedule.clone(),
                timesteps.clone(),
                DdimConfig {
                    num_inference_steps: self.config.steps,
                    eta: self.config.ddim_eta,
                },
            )),
            Schedule::Sigmas(sigmas) => Box::new(OdeIntegrator::<B>::new(
                match self.config.sampler {
                    SamplerKind::Klms => OdeMethod::Lms,
                    SamplerKind::EulerA => OdeMethod::EulerAncestral,
                    SamplerKind::Dpm2A => OdeMethod::Dpm2Ancestral,
                    // ddim never produces a sigma schedule
                    SamplerKind::Euler | SamplerKind::Ddim => OdeMethod::Euler,
                },
                sigmas.clone(),
            )),
        };

        // side channels ride along every latent row
        let to_rows = |t: Tensor<B, 4>| {
            let have = t.dims()[0];
            if have == rows {
                t
            } else {
                t.repeat_dim(0, rows / have)
            }
        };
        let (mask, masked_latent) = match &side.mask {
            Some(prepared) => (
                Some(to_rows(prepared.mask.clone())),
                Some(to_rows(prepared.masked_latent.clone())),
            ),
            None => (None, None),
        };
        let channels = SideChannels {
            mask: mask.clone(),
            masked_latent: masked_latent.clone(),
            depth: side.depth.clone().map(to_rows),
            edit_latent: side.edit_latent.clone().map(to_rows),
            control_hint: side.control_hint.clone(),
        };

        self.phase = SamplePhase::Running {
            step: side.offset,
            total: self.active.len(),
        };
        let denoised = {
            let mut guided = GuidedDenoiser {
                models: &mut self.models,
                arbiter: self.arbiter,
                schedule: &self.schedule,
                conditioning: conds,
                mode,
                weights: conditioning.weights.clone(),
                cfg_scale,
                img_scale: self.config.img_scale.unwrap_or(0.0),
                control_scale: self.config.control_scale,
                variant: self.variant,
                prediction: self.config.prediction,
                sigma_space: self.config.sampler.is_ode(),
                side: channels,
                debug: self.config.debug,
            };
            denoise_loop(
                integrator.as_mut(),
                &mut guided,
                folded,
                side.offset,
                &mut self.rng,
                on_step,
            )
        };

        // standard-model inpainting: where the mask is 1 the source
        // latent survives; the rest takes the generated latent
        let denoised = match (self.variant, mask, masked_latent) {
            (ModelVariant::Inpaint, _, _) | (_, None, _) | (_, _, None) => denoised,
            (_, Some(mask), Some(masked)) => {
                self.phase = SamplePhase::InpaintComposite;
                masked * mask.clone() + denoised * (mask.neg() + 1.0)
            }
        };

        self.phase = SamplePhase::Decoding;
        let pixels = {
            let vae = self.arbiter.lease(&mut *self.models.vae);
            decode_latent(
                &*vae,
                Latent::unfold(denoised, frames),
                self.config.latent_scale_factor,
            )
        };
        self.phase = SamplePhase::Done;
        Ok(pixels)
    }
}
