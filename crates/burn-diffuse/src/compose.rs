//! Conditioning composition
//!
//! Assembles the conditioning tensor for one denoiser call from the
//! unconditional embedding and the prompt embeddings, according to the
//! guidance scale. The guided latent batch is the conditioning batch
//! divided into equal blocks; [`GuidanceMode`] records how many blocks
//! there are and how the resulting noise predictions recombine.

use burn::prelude::*;

use burn_diffuse_samplers::uniform_weights;

/// How the per-block noise predictions recombine after the forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceMode {
    /// Guidance off; single unconditional block
    UncondOnly,
    /// Guidance scale one; single conditional block, no extrapolation
    CondOnly,
    /// `[uncond, text_1, ..., text_n]` blocks, weighted extrapolation
    Weighted { prompts: usize },
    /// `[uncond, image_guided, text_1, ..., text_n]` blocks
    PixelEdit { prompts: usize },
}

impl GuidanceMode {
    /// Number of equal blocks in the composed batch
    pub fn num_blocks(&self) -> usize {
        match self {
            GuidanceMode::UncondOnly | GuidanceMode::CondOnly => 1,
            GuidanceMode::Weighted { prompts } => prompts + 1,
            GuidanceMode::PixelEdit { prompts } => prompts + 2,
        }
    }
}

/// Prompt embeddings for one generation call
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    /// Unconditional (empty-prompt) embedding, `[1, seq, dim]`
    pub uncond: Tensor<B, 3>,
    /// One embedding per prompt, each `[1, seq, dim]`
    pub prompts: Vec<Tensor<B, 3>>,
    /// Per-prompt guidance weights, uniform `1/N` unless overridden
    pub weights: Vec<f32>,
}

impl<B: Backend> Conditioning<B> {
    /// Uniformly weighted prompts
    pub fn new(uncond: Tensor<B, 3>, prompts: Vec<Tensor<B, 3>>) -> Self {
        let weights = uniform_weights(prompts.len());
        Self {
            uncond,
            prompts,
            weights,
        }
    }

    /// Override the per-prompt weights; a length mismatch falls back
    /// to uniform.
    pub fn with_weights(mut self, weights: Vec<f32>) -> Self {
        self.weights = if weights.len() == self.prompts.len() {
            weights
        } else {
            uniform_weights(self.prompts.len())
        };
        self
    }

    /// Compose the conditioning batch for one denoiser call.
    ///
    /// Every block is replicated to `batch` rows; blocks are stacked
    /// along the batch axis in the order [`GuidanceMode`] documents.
    pub fn compose(
        &self,
        cfg_scale: f32,
        pixel_edit: bool,
        batch: usize,
    ) -> (Tensor<B, 3>, GuidanceMode) {
        let per_batch = |t: &Tensor<B, 3>| {
            if t.dims()[0] == batch {
                t.clone()
            } else {
                t.clone().repeat_dim(0, batch)
            }
        };

        // no prompts leaves nothing to extrapolate towards
        if cfg_scale == 0.0 || self.prompts.is_empty() {
            return (per_batch(&self.uncond), GuidanceMode::UncondOnly);
        }

        if cfg_scale == 1.0 {
            // no extrapolation possible; the first prompt conditions
            // the whole batch directly
            return (per_batch(&self.prompts[0]), GuidanceMode::CondOnly);
        }

        let mut blocks = Vec::with_capacity(self.prompts.len() + 2);
        blocks.push(per_batch(&self.uncond));
        if pixel_edit {
            blocks.push(per_batch(&self.uncond));
        }
        for prompt in &self.prompts {
            blocks.push(per_batch(prompt));
        }
        let mode = if pixel_edit {
            GuidanceMode::PixelEdit {
                prompts: self.prompts.len(),
            }
        } else {
            GuidanceMode::Weighted {
                prompts: self.prompts.len(),
            }
        };
        (Tensor::cat(blocks, 0), mode)
    }
}
