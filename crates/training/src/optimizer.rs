use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::config::{OptimizerConfig, TrainingError};

const EPS: f64 = 1e-12;

/// Adam over a fixed set of named parameters. Gradients are pulled from
/// the `GradStore` produced by `loss.backward()`; parameters without a
/// gradient in a given step are skipped. `step` returns the global
/// gradient norm for logging.
#[derive(Debug)]
pub struct Adam {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl Adam {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-f32 parameter '{}'",
                    name
                )));
            }
            let first_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?;
            let second_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?;
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<f64, TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                let norm = tensor_l2_norm(&grad)?;
                processed.push((index, grad, norm));
            }
        }

        if processed.is_empty() {
            return Ok(0.0);
        }

        let global_norm = processed
            .iter()
            .map(|(_, _, norm)| norm * norm)
            .sum::<f64>()
            .sqrt();

        self.step += 1;
        let cfg = self.config.clone();
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for (index, grad, _) in processed {
            let slot = &mut self.params[index];

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let m_hat = new_m.affine(scale_m, 0.0)?;
            let v_hat = new_v.affine(scale_v, 0.0)?;
            let denom = v_hat.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;

            let base = if cfg.weight_decay != 0.0 {
                slot.param
                    .as_tensor()
                    .affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                slot.param.as_tensor().clone()
            };
            let next = base.sub(&update)?;
            slot.param.set(&next)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(global_norm)
    }
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor.sqr()?.sum_all()?;
    let value = squared.to_vec0::<f32>()?;
    Ok((value as f64).sqrt())
}
