//! Guidance combination
//!
//! Folds the per-block noise predictions of one denoiser call into a
//! single guided estimate: standard weighted multi-prompt
//! classifier-free guidance, and the pixel-edit variant with a separate
//! image-guidance term.

use burn::prelude::*;

/// Uniform prompt weights, `1/n` each
pub fn uniform_weights(n: usize) -> Vec<f32> {
    let n = n.max(1);
    vec![1.0 / n as f32; n]
}

/// Weighted multi-prompt classifier-free guidance.
///
/// `chunks` is `[uncond, text_1, text_2, ...]`; the result is
/// `uncond + cfg * Σ w_i * (text_i - uncond)`, prompts combined in
/// order, weights wrapping modulo their own length.
pub fn combine_weighted<B: Backend>(
    chunks: &[Tensor<B, 4>],
    cfg_scale: f32,
    weights: &[f32],
) -> Tensor<B, 4> {
    let uncond = chunks[0].clone();
    let mut out = uncond.clone();
    for (i, text) in chunks[1..].iter().enumerate() {
        let w = weights[i % weights.len()];
        out = out + (text.clone() - uncond.clone()) * (cfg_scale * w);
    }
    out
}

/// Pixel-edit (image-guided) combination.
///
/// `chunks` is `[uncond, image_guided, text_1, ...]`; the image term is
/// extrapolated from the unconditional baseline and each text term from
/// the image-guided one.
pub fn combine_pixel_edit<B: Backend>(
    chunks: &[Tensor<B, 4>],
    cfg_scale: f32,
    img_scale: f32,
    weights: &[f32],
) -> Tensor<B, 4> {
    let uncond = chunks[0].clone();
    let image = chunks[1].clone();
    let mut out = uncond.clone() + (image.clone() - uncond) * img_scale;
    for (i, text) in chunks[2..].iter().enumerate() {
        let w = weights[i % weights.len()];
        out = out + (text.clone() - image.clone()) * (cfg_scale * w);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    type B = burn_ndarray::NdArray<f32>;

    fn filled(v: f32) -> Tensor<B, 4> {
        Tensor::ones([1, 4, 2, 2], &Default::default()) * v
    }

    fn scalar_of(t: Tensor<B, 4>) -> f32 {
        t.mean().into_scalar()
    }

    #[test]
    fn test_weighted_two_prompts() {
        // uncond=0, text1=1, text2=2, weights [0.3, 0.7], cfg 7
        let out = combine_weighted(
            &[filled(0.0), filled(1.0), filled(2.0)],
            7.0,
            &[0.3, 0.7],
        );
        let expected = 7.0 * (0.3 * 1.0 + 0.7 * 2.0);
        assert!((scalar_of(out) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_weights_wrap_modulo_length() {
        // three prompts, one weight: every prompt uses it
        let out = combine_weighted(
            &[filled(0.0), filled(1.0), filled(1.0), filled(1.0)],
            2.0,
            &[0.5],
        );
        assert!((scalar_of(out) - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_pixel_edit_combination() {
        // uncond=0, image=1, text=3, img_scale 1.5, cfg 2, w 1
        let out = combine_pixel_edit(
            &[filled(0.0), filled(1.0), filled(3.0)],
            2.0,
            1.5,
            &[1.0],
        );
        // 0 + 1.5*(1-0) + 2*1*(3-1) = 5.5
        assert!((scalar_of(out) - 5.5).abs() < 1e-5);
    }
}
