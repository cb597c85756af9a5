//! burn-diffuse CLI
//!
//! Inspection front end for the sampling engine: resolve and validate a
//! generation config, preview the truncated schedule, and dump seeded
//! initial-noise latents. Model loading lives with the collaborator
//! crates; everything here runs without weights.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use image::{ImageBuffer, Rgb};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;

use burn::prelude::*;
use burn_diffuse::{BackendCaps, GenConfig, ModelVariant, SamplerKind};
use burn_diffuse_samplers::{
    randn, truncate_sigmas, truncate_timesteps, NoiseSchedule, Schedule,
};

type Backend = burn_ndarray::NdArray<f32>;

const SCHEDULE_WARMUP: usize = 1;

#[derive(Parser)]
#[command(name = "burn-diffuse")]
#[command(about = "Latent-diffusion sampling engine tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VariantArg {
    Standard,
    Inpaint,
    Depth,
    PixelEdit,
}

impl From<VariantArg> for ModelVariant {
    fn from(v: VariantArg) -> Self {
        match v {
            VariantArg::Standard => ModelVariant::Standard,
            VariantArg::Inpaint => ModelVariant::Inpaint,
            VariantArg::Depth => ModelVariant::Depth,
            VariantArg::PixelEdit => ModelVariant::PixelEdit,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a generation config and preview the active schedule
    Plan {
        /// Sampler name (ddim, klms, euler, euler_a, dpm2_a)
        #[arg(long, default_value = "ddim")]
        sampler: String,

        /// Number of inference steps
        #[arg(long, default_value = "50")]
        steps: usize,

        /// Schedule fraction actually executed (image-to-image)
        #[arg(long, default_value = "1.0")]
        strength: f64,

        /// Guidance scale
        #[arg(long, default_value = "7.5")]
        cfg: f32,

        /// Image-guidance scale (pixel-edit mode)
        #[arg(long)]
        img_scale: Option<f32>,

        /// Batch size
        #[arg(long, default_value = "1")]
        batch: usize,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Model variant the config targets
        #[arg(long, value_enum, default_value = "standard")]
        variant: VariantArg,

        /// Validate against single-owner device residency
        #[arg(long)]
        lowmem: bool,
    },

    /// Dump the seeded initial-noise latent as a PNG
    Noise {
        /// Sampler name (sets the initial noise scale)
        #[arg(long, default_value = "ddim")]
        sampler: String,

        /// Number of inference steps
        #[arg(long, default_value = "50")]
        steps: usize,

        /// Image width in pixels
        #[arg(long, default_value = "512")]
        width: usize,

        /// Image height in pixels
        #[arg(long, default_value = "512")]
        height: usize,

        /// Number of latents to dump
        #[arg(long, default_value = "1")]
        batch: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Output path (batch > 1 appends an index)
        #[arg(short, long, default_value = "noise.png")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Plan {
            sampler,
            steps,
            strength,
            cfg,
            img_scale,
            batch,
            seed,
            variant,
            lowmem,
        } => plan(
            &sampler, steps, strength, cfg, img_scale, batch, seed, variant, lowmem,
        ),
        Commands::Noise {
            sampler,
            steps,
            width,
            height,
            batch,
            seed,
            output,
        } => noise(&sampler, steps, width, height, batch, seed, &output),
    }
}

fn resolve_schedule(sampler: SamplerKind, steps: usize, strength: f64) -> Schedule {
    let schedule = NoiseSchedule::sd();
    if sampler.is_ode() {
        let sigmas = schedule.spaced_sigmas(steps);
        Schedule::Sigmas(truncate_sigmas(&sigmas, steps, strength, SCHEDULE_WARMUP))
    } else {
        let timesteps = schedule.spaced_timesteps(steps);
        Schedule::Timesteps(truncate_timesteps(
            &timesteps,
            steps,
            strength,
            SCHEDULE_WARMUP,
        ))
    }
}

#[allow(clippy::too_many_arguments)]
fn plan(
    sampler: &str,
    steps: usize,
    strength: f64,
    cfg: f32,
    img_scale: Option<f32>,
    batch: usize,
    seed: Option<u64>,
    variant: VariantArg,
    lowmem: bool,
) -> Result<()> {
    let sampler: SamplerKind = sampler
        .parse()
        .with_context(|| format!("bad --sampler '{sampler}'"))?;
    let config = GenConfig {
        sampler,
        steps,
        strength,
        cfg_scale: cfg,
        img_scale,
        batch,
        seed,
        lowmem,
        ..Default::default()
    };
    let variant: ModelVariant = variant.into();

    // assume the outer stack provides what the flags demand; the engine
    // re-validates against the real components at construction
    let caps = BackendCaps {
        flash_attention: true,
    };
    config
        .validate(variant, caps, false, lowmem)
        .context("invalid configuration")?;

    println!("burn-diffuse plan\n");
    println!("  sampler:   {}", sampler.name());
    println!("  variant:   {} ({} ch)", variant.name(), variant.denoiser_in_channels());
    println!("  steps:     {steps} (strength {strength:.2})");
    println!("  guidance:  {cfg}");
    if let Some(img) = img_scale {
        println!("  img scale: {img}");
    }
    println!("  batch:     {batch}");
    match seed {
        Some(seed) => println!("  seed:      {seed}"),
        None => println!("  seed:      (from clock)"),
    }

    let active = resolve_schedule(sampler, steps, strength);
    println!("\n  {} denoise transitions", active.len());
    match &active {
        Schedule::Timesteps(ts) => {
            println!("  timesteps: {:?}", preview(ts));
        }
        Schedule::Sigmas(sigmas) => {
            let rounded: Vec<String> = preview(sigmas)
                .iter()
                .map(|s| format!("{s:.3}"))
                .collect();
            println!("  sigmas:    [{}]", rounded.join(", "));
            println!("  init noise scale: {:.3}", active.init_noise_scale());
        }
    }
    Ok(())
}

/// First and last few entries of a long sequence
fn preview<T: Copy>(values: &[T]) -> Vec<T> {
    if values.len() <= 8 {
        values.to_vec()
    } else {
        let mut out = values[..4].to_vec();
        out.extend_from_slice(&values[values.len() - 4..]);
        out
    }
}

fn noise(
    sampler: &str,
    steps: usize,
    width: usize,
    height: usize,
    batch: usize,
    seed: u64,
    output: &PathBuf,
) -> Result<()> {
    let sampler: SamplerKind = sampler
        .parse()
        .with_context(|| format!("bad --sampler '{sampler}'"))?;
    let active = resolve_schedule(sampler, steps, 1.0);
    let scale = active.init_noise_scale();

    let (h, w) = (height / 8, width / 8);
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(seed);

    let pb = ProgressBar::new(batch as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap(),
    );

    for i in 0..batch {
        let latent = randn::<Backend, 4>([1, 4, h, w], &mut rng, &device) * scale;
        let path = if batch == 1 {
            output.clone()
        } else {
            indexed_path(output, i)
        };
        save_latent_png(&latent, &path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        pb.inc(1);
    }
    pb.finish_with_message("done");
    println!("seed {seed}, init noise scale {scale:.3}");
    Ok(())
}

fn indexed_path(base: &PathBuf, index: usize) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "noise".to_string());
    let ext = base
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_string());
    base.with_file_name(format!("{stem}-{index:03}.{ext}"))
}

/// Map the first three latent channels to RGB, min-max normalized
fn save_latent_png(latent: &Tensor<Backend, 4>, path: &PathBuf) -> Result<()> {
    let [_, _, h, w] = latent.dims();
    let min = latent.clone().min().into_scalar();
    let max = latent.clone().max().into_scalar();
    let range = (max - min).max(1e-8);
    let values: Vec<f32> = latent.clone().into_data().to_vec().unwrap();

    let plane = h * w;
    let img = ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
        let idx = y as usize * w + x as usize;
        let px = |c: usize| {
            let v = (values[c * plane + idx] - min) / range;
            (v * 255.0) as u8
        };
        Rgb([px(0), px(1), px(2)])
    });
    img.save(path)?;
    Ok(())
}
