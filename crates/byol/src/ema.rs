//! Exponential moving average over paired parameter maps.

use candle_core::{Error, Result, Tensor};
use candle_nn::VarMap;

/// Weighted running average with decay `beta`: recent values enter with
/// weight `1 - beta`.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    beta: f64,
}

impl Ema {
    pub fn new(beta: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&beta) {
            return Err(Error::Msg(format!(
                "moving average decay must be in [0, 1), got {}",
                beta
            )));
        }
        Ok(Self { beta })
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// `beta * old + (1 - beta) * new`, element-wise.
    pub fn average(&self, old: &Tensor, new: &Tensor) -> Result<Tensor> {
        old.affine(self.beta, 0.0)? + new.affine(1.0 - self.beta, 0.0)?
    }

    /// Folds the online parameters into the target parameters in place,
    /// pairing entries by name. The two maps must carry the same parameter
    /// set, which holds when the target was snapshotted from the online map.
    pub fn update_vars(&self, target: &VarMap, online: &VarMap) -> Result<()> {
        let online_data = online.data().lock().unwrap();
        let target_data = target.data().lock().unwrap();
        for (name, target_var) in target_data.iter() {
            let online_var = online_data.get(name).ok_or_else(|| {
                Error::Msg(format!(
                    "online network is missing parameter '{}' present in target",
                    name
                ))
            })?;
            let averaged = self.average(target_var.as_tensor(), online_var.as_tensor())?;
            target_var.set(&averaged)?;
        }
        Ok(())
    }
}
