//! Pixel <-> latent conversion
//!
//! Wraps the frozen autoencoder with the scaling constant of the latent
//! space and the frame folding used for video batches. The denoising
//! loop itself only ever sees rank-4 tensors; a video latent folds its
//! frame axis into the batch axis on the way in and restores it on the
//! way out.

use burn::prelude::*;

use crate::models::VaeCodec;

/// A latent batch, spatial or spatio-temporal
#[derive(Debug, Clone)]
pub enum Latent<B: Backend> {
    /// `[batch, channels, height, width]`
    Image(Tensor<B, 4>),
    /// `[batch, channels, frames, height, width]`
    Video(Tensor<B, 5>),
}

impl<B: Backend> Latent<B> {
    /// Fold into the rank-4 layout the denoiser operates on.
    /// Returns the folded tensor and the frame count to restore later.
    pub fn fold(self) -> (Tensor<B, 4>, Option<usize>) {
        match self {
            Latent::Image(lat) => (lat, None),
            Latent::Video(lat) => {
                let [b, c, f, h, w] = lat.dims();
                let folded = lat.swap_dims(1, 2).reshape([b * f, c, h, w]);
                (folded, Some(f))
            }
        }
    }

    /// Inverse of [`fold`](Self::fold)
    pub fn unfold(folded: Tensor<B, 4>, frames: Option<usize>) -> Self {
        match frames {
            None => Latent::Image(folded),
            Some(f) => {
                let [bf, c, h, w] = folded.dims();
                let b = bf / f;
                Latent::Video(folded.reshape([b, f, c, h, w]).swap_dims(1, 2))
            }
        }
    }

}

/// Encode pixels to a scaled latent.
///
/// `noise` selects the posterior sample; pass `None` to take the
/// posterior mean (deterministic encode, used for masked-region latents
/// and inversion inputs).
pub fn encode_pixels<B: Backend>(
    vae: &dyn VaeCodec<B>,
    pixels: Tensor<B, 4>,
    scale_factor: f64,
    noise: Option<Tensor<B, 4>>,
) -> Tensor<B, 4> {
    let posterior = vae.encode(pixels);
    let lat = match noise {
        Some(noise) => posterior.sample(noise),
        None => posterior.mean,
    };
    lat * scale_factor as f32
}

/// Decode a scaled latent back to pixels, restoring the frame axis for
/// video batches.
pub fn decode_latent<B: Backend>(
    vae: &dyn VaeCodec<B>,
    latent: Latent<B>,
    scale_factor: f64,
) -> Latent<B> {
    let (folded, frames) = latent.fold();
    let pixels = vae.decode(folded / scale_factor as f32);
    Latent::unfold(pixels, frames)
}

/// Replicate a single-sample latent across the batch axis.
/// A latent that already matches the batch size passes through.
pub fn replicate_batch<B: Backend>(latent: Tensor<B, 4>, batch: usize) -> Tensor<B, 4> {
    if latent.dims()[0] == batch {
        latent
    } else {
        latent.repeat_dim(0, batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Component, DiagonalGaussian};

    type B = burn_ndarray::NdArray<f32>;

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
    fn test_scaling_cancels_on_roundtrip() {
        let pixels = Tensor::<B, 4>::random(
            [1, 4, 4, 4],
            burn::tensor::Distribution::Default,
            &Default::default(),
        );
        let lat = encode_pixels(&IdentityVae, pixels.clone(), 0.18215, None);
        let back = decode_latent(&IdentityVae, Latent::Image(lat), 0.18215);
        match back {
            Latent::Image(t) => {
                assert!(t.sub(pixels).abs().max().into_scalar() < 1e-6)
            }
            _ => panic!("expected image latent"),
        }
    }

    #[test]
    fn test_video_fold_roundtrip() {
        let lat = Tensor::<B, 5>::random(
            [2, 4, 3, 8, 8],
            burn::tensor::Distribution::Default,
            &Default::default(),
        );
        let original = Latent::Video(lat.clone());
        let (folded, frames) = original.fold();
        assert_eq!(folded.dims(), [6, 4, 8, 8]);
        assert_eq!(frames, Some(3));

        let restored = Latent::unfold(folded, frames);
        match restored {
            Latent::Video(t) => assert!(t
                .sub(lat)
                .abs()
                .max()
                .into_scalar()
                .abs() < 1e-6),
            _ => panic!("expected video latent"),
        }
    }

    #[test]
    fn test_fold_preserves_frame_order() {
        // frame axis must fold contiguously per batch row
        let data: Vec<f32> = (0..2 * 1 * 3 * 1 * 1).map(|i| i as f32).collect();
        let lat = Tensor::<B, 5>::from_data(
            TensorData::new(data, [2, 1, 3, 1, 1]),
            &Default::default(),
        );
        let (folded, _) = Latent::Video(lat).fold();
        let flat: Vec<f32> = folded.into_data().to_vec().unwrap();
        assert_eq!(flat, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_replicate_batch() {
        let lat = Tensor::<B, 4>::ones([1, 4, 2, 2], &Default::default());
        assert_eq!(replicate_batch(lat.clone(), 3).dims(), [3, 4, 2, 2]);
        assert_eq!(replicate_batch(lat.repeat_dim(0, 2), 2).dims(), [2, 4, 2, 2]);
    }
}
