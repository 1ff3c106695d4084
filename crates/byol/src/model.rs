//! BYOL orchestrator: online branch, target branch, symmetric loss.

use candle_core::{DType, Error, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use encoder::Encoder;

use crate::{
    ema::Ema,
    loss::regression_loss,
    mlp::Mlp,
    wrapper::{named_vars, LayerSelector, NetWrapper},
};

#[derive(Debug, Clone)]
pub struct ByolConfig {
    /// Side length of the (square) training images.
    pub image_size: usize,
    /// Backbone stage whose activation feeds the projector.
    pub hidden_layer: LayerSelector,
    pub projection_size: usize,
    pub projection_hidden_size: usize,
    pub moving_average_decay: f64,
}

impl Default for ByolConfig {
    fn default() -> Self {
        Self {
            image_size: 96,
            hidden_layer: LayerSelector::ByIndex(-2),
            projection_size: 256,
            projection_hidden_size: 4096,
            moving_average_decay: 0.99,
        }
    }
}

/// Self-supervised twin of the wrapped backbone.
///
/// The target encoder does not exist until the first forward pass; it is then
/// a snapshot of the online encoder taken *after* the online projector has
/// been forced, so both branches start from identical weights. It is never
/// registered with an optimizer and only moves through [`Byol::update_moving_average`].
pub struct Byol {
    online_encoder: NetWrapper,
    online_predictor: Mlp,
    predictor_vars: VarMap,
    target_encoder: Option<NetWrapper>,
    ema: Ema,
    image_size: usize,
    train: bool,
}

impl Byol {
    /// Builds both online heads and runs one throwaway forward pass so every
    /// lazily-created parameter exists before the caller enumerates them for
    /// an optimizer.
    pub fn new(encoder: Encoder, config: &ByolConfig) -> Result<Self> {
        let device = encoder.device().clone();
        let online_encoder = NetWrapper::new(
            encoder,
            &config.hidden_layer,
            config.projection_size,
            config.projection_hidden_size,
        )?;

        let predictor_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&predictor_vars, DType::F32, &device);
        let online_predictor = Mlp::new(
            vb.pp("predictor"),
            config.projection_size,
            config.projection_size,
            config.projection_hidden_size,
        )?;

        let mut model = Self {
            online_encoder,
            online_predictor,
            predictor_vars,
            target_encoder: None,
            ema: Ema::new(config.moving_average_decay)?,
            image_size: config.image_size,
            train: true,
        };

        let shape = (2, 3, config.image_size, config.image_size);
        let mock_a = Tensor::randn(0f32, 1f32, shape, &device)?;
        let mock_b = Tensor::randn(0f32, 1f32, shape, &device)?;
        model.forward(&mock_a, &mock_b)?;

        Ok(model)
    }

    pub fn set_training(&mut self, train: bool) {
        self.train = train;
    }

    pub fn is_training(&self) -> bool {
        self.train
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn online_encoder(&self) -> &NetWrapper {
        &self.online_encoder
    }

    pub fn target_exists(&self) -> bool {
        self.target_encoder.is_some()
    }

    /// Named online-branch parameters (encoder, projector, predictor); the
    /// target branch is deliberately absent so it can never reach an
    /// optimizer.
    pub fn trainable_parameters(&self) -> Vec<(String, Var)> {
        let mut params: Vec<(String, Var)> = named_vars(self.online_encoder.vars())
            .into_iter()
            .map(|(name, var)| (format!("online_encoder.{}", name), var))
            .collect();
        params.extend(
            named_vars(&self.predictor_vars)
                .into_iter()
                .map(|(name, var)| (format!("online_predictor.{}", name), var)),
        );
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    /// Symmetric BYOL loss over two augmented views, averaged over the batch.
    /// Target projections are detached; gradients only flow through the
    /// online branch.
    pub fn forward(&mut self, image_a: &Tensor, image_b: &Tensor) -> Result<Tensor> {
        let online_proj_a = self.online_encoder.project(image_a, self.train)?;
        let online_proj_b = self.online_encoder.project(image_b, self.train)?;

        let pred_a = self.online_predictor.forward(&online_proj_a, self.train)?;
        let pred_b = self.online_predictor.forward(&online_proj_b, self.train)?;

        if self.target_encoder.is_none() {
            self.target_encoder = Some(self.online_encoder.snapshot()?);
        }
        let target = self
            .target_encoder
            .as_mut()
            .ok_or_else(|| Error::Msg("target encoder failed to initialize".into()))?;

        let target_proj_a = target.project(image_a, self.train)?.detach();
        let target_proj_b = target.project(image_b, self.train)?.detach();

        let loss_a = regression_loss(&pred_a, &target_proj_b)?;
        let loss_b = regression_loss(&pred_b, &target_proj_a)?;
        (loss_a + loss_b)?.mean_all()
    }

    /// Folds the current online weights into the target by EMA. Must run
    /// after the optimizer step of the same training step.
    pub fn update_moving_average(&mut self) -> Result<()> {
        let target = self.target_encoder.as_ref().ok_or_else(|| {
            Error::Msg("target encoder has not been created yet; run a forward pass first".into())
        })?;
        self.ema
            .update_vars(target.vars(), self.online_encoder.vars())
    }

    /// Drops the target branch; the next forward pass re-snapshots the
    /// current online weights.
    pub fn reset_moving_average(&mut self) {
        self.target_encoder = None;
    }

    pub fn target_encoder(&self) -> Option<&NetWrapper> {
        self.target_encoder.as_ref()
    }
}
