//! Two-layer perceptron used for both the projector and predictor heads.

use candle_core::{Result, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, BatchNormConfig, Linear, Module, ModuleT, VarBuilder};

const LEAKY_SLOPE: f64 = 0.01;

/// linear -> batch norm -> leaky ReLU -> linear.
pub struct Mlp {
    fc1: Linear,
    bn: BatchNorm,
    fc2: Linear,
    input_dim: usize,
}

impl Mlp {
    pub fn new(
        vb: VarBuilder,
        dim: usize,
        projection_size: usize,
        hidden_size: usize,
    ) -> Result<Self> {
        let fc1 = linear(dim, hidden_size, vb.pp("fc1"))?;
        let bn = batch_norm(hidden_size, BatchNormConfig::default(), vb.pp("bn"))?;
        let fc2 = linear(hidden_size, projection_size, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            bn,
            fc2,
            input_dim: dim,
        })
    }

    /// Feature dimension this head was built for.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.fc1.forward(xs)?;
        let hidden = self.bn.forward_t(&hidden, train)?;
        let hidden = leaky_relu(&hidden)?;
        self.fc2.forward(&hidden)
    }
}

fn leaky_relu(xs: &Tensor) -> Result<Tensor> {
    xs.maximum(&xs.affine(LEAKY_SLOPE, 0.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn maps_to_projection_size() -> Result<()> {
        let device = Device::Cpu;
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, &device);
        let mlp = Mlp::new(vb, 32, 8, 16)?;

        let xs = Tensor::randn(0f32, 1f32, (4, 32), &device)?;
        let ys = mlp.forward(&xs, true)?;

        assert_eq!(ys.dims(), &[4, 8]);
        assert_eq!(mlp.input_dim(), 32);
        Ok(())
    }

    #[test]
    fn leaky_relu_keeps_positive_and_scales_negative() -> Result<()> {
        let device = Device::Cpu;
        let xs = Tensor::from_slice(&[-2.0f32, 0.0, 3.0], (3,), &device)?;
        let ys = leaky_relu(&xs)?.to_vec1::<f32>()?;
        assert!((ys[0] + 0.02).abs() < 1e-6);
        assert_eq!(ys[1], 0.0);
        assert_eq!(ys[2], 3.0);
        Ok(())
    }
}
