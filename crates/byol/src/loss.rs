//! BYOL regression loss over L2-normalized embeddings.

use candle_core::{Result, Tensor, D};

const NORM_EPS: f64 = 1e-12;

fn normalize_l2(xs: &Tensor) -> Result<Tensor> {
    let norm = xs
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .affine(1.0, NORM_EPS)?;
    xs.broadcast_div(&norm)
}

/// Per-sample `2 - 2 * cos_sim(x, y)` along the feature axis; invariant to
/// positive rescaling of either argument.
pub fn regression_loss(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let x = normalize_l2(x)?;
    let y = normalize_l2(y)?;
    let similarity = x.mul(&y)?.sum(D::Minus1)?;
    similarity.affine(-2.0, 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn self_similarity_is_minimal() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (4, 16), &device)?;
        let loss = regression_loss(&x, &x)?.to_vec1::<f32>()?;
        for value in loss {
            assert!(value.abs() < 1e-5, "expected ~0, got {}", value);
        }
        Ok(())
    }

    #[test]
    fn invariant_to_positive_rescaling() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (4, 16), &device)?;
        let y = Tensor::randn(0f32, 1f32, (4, 16), &device)?;

        let base = regression_loss(&x, &y)?.to_vec1::<f32>()?;
        let scaled = regression_loss(&x.affine(7.5, 0.0)?, &y.affine(0.25, 0.0)?)?
            .to_vec1::<f32>()?;

        for (a, b) in base.iter().zip(scaled.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn opposite_vectors_hit_the_maximum() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_slice(&[1.0f32, 0.0], (1, 2), &device)?;
        let y = Tensor::from_slice(&[-1.0f32, 0.0], (1, 2), &device)?;
        let loss = regression_loss(&x, &y)?.to_vec1::<f32>()?;
        assert!((loss[0] - 4.0).abs() < 1e-5);
        Ok(())
    }
}
