//! Wraps a backbone encoder, exposing a projection of a chosen hidden stage.
//!
//! The stage selector is resolved once at construction; the projector head is
//! built lazily on the first projection because its input width is only known
//! once a real activation has been seen, and is cached for every later call.

use candle_core::{DType, Error, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use encoder::{Encoder, Stage};

use crate::mlp::Mlp;

const PROJECTOR_PREFIX: &str = "projector";

/// Which activation of the backbone feeds the projector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSelector {
    /// A stage looked up by its registered name, e.g. `"avgpool"`.
    ByName(String),
    /// A position in the ordered stage list; negative values count from the
    /// end, and `-1` is the backbone's raw output.
    ByIndex(i64),
    /// The backbone's raw output.
    Output,
}

impl LayerSelector {
    fn resolve(&self) -> Result<Stage> {
        match self {
            LayerSelector::ByName(name) => Stage::from_name(name).ok_or_else(|| {
                Error::Msg(format!("hidden layer '{}' not found in backbone", name))
            }),
            LayerSelector::ByIndex(index) => Stage::from_index(*index).ok_or_else(|| {
                Error::Msg(format!("hidden layer index {} out of range", index))
            }),
            LayerSelector::Output => Ok(Stage::Fc),
        }
    }
}

/// Sorted `(name, var)` pairs of a parameter map.
pub fn named_vars(vars: &VarMap) -> Vec<(String, Var)> {
    let data = vars.data().lock().unwrap();
    let mut out: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Backbone plus lazily-built projector head.
pub struct NetWrapper {
    encoder: Encoder,
    stage: Stage,
    projector: Option<Mlp>,
    projection_size: usize,
    projection_hidden_size: usize,
}

impl NetWrapper {
    pub fn new(
        encoder: Encoder,
        selector: &LayerSelector,
        projection_size: usize,
        projection_hidden_size: usize,
    ) -> Result<Self> {
        let stage = selector.resolve()?;
        Ok(Self {
            encoder,
            stage,
            projector: None,
            projection_size,
            projection_hidden_size,
        })
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The full parameter map: backbone weights plus, once built, the
    /// projector head under the `projector` prefix.
    pub fn vars(&self) -> &VarMap {
        self.encoder.vars()
    }

    /// Backbone-only parameters, the part worth checkpointing.
    pub fn encoder_vars(&self) -> Vec<(String, Var)> {
        named_vars(self.encoder.vars())
            .into_iter()
            .filter(|(name, _)| !name.starts_with(PROJECTOR_PREFIX))
            .collect()
    }

    /// Flattened activation of the selected stage.
    pub fn representation(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        self.encoder.forward_to(images, self.stage, train)
    }

    /// Representation pushed through the projector head, building the head
    /// on first use from the observed feature width.
    pub fn project(&mut self, images: &Tensor, train: bool) -> Result<Tensor> {
        let representation = self.representation(images, train)?;
        let dims = representation.dims();
        if dims.len() != 2 || dims[1] == 0 {
            return Err(Error::Msg(format!(
                "selected stage emitted no usable activation, shape {:?}",
                dims
            )));
        }
        if self.projector.is_none() {
            let vb = VarBuilder::from_varmap(
                self.encoder.vars(),
                DType::F32,
                self.encoder.device(),
            );
            self.projector = Some(Mlp::new(
                vb.pp(PROJECTOR_PREFIX),
                dims[1],
                self.projection_size,
                self.projection_hidden_size,
            )?);
        }
        match &self.projector {
            Some(projector) => projector.forward(&representation, train),
            None => Err(Error::Msg("projector head failed to initialize".into())),
        }
    }

    pub fn projector_built(&self) -> bool {
        self.projector.is_some()
    }

    /// Deep copy: every parameter tensor is cloned into a fresh map and the
    /// module structure is rebuilt over it. Cost is proportional to the
    /// parameter count.
    pub fn snapshot(&self) -> Result<NetWrapper> {
        let vars = VarMap::new();
        {
            let source = self.encoder.vars().data().lock().unwrap();
            let mut destination = vars.data().lock().unwrap();
            for (name, var) in source.iter() {
                let copied = var.as_tensor().detach().copy()?;
                destination.insert(name.clone(), Var::from_tensor(&copied)?);
            }
        }

        let encoder = Encoder::from_vars(
            self.encoder.config().clone(),
            vars,
            self.encoder.device(),
        )?;

        let projector = match &self.projector {
            Some(existing) => {
                let vb =
                    VarBuilder::from_varmap(encoder.vars(), DType::F32, encoder.device());
                Some(Mlp::new(
                    vb.pp(PROJECTOR_PREFIX),
                    existing.input_dim(),
                    self.projection_size,
                    self.projection_hidden_size,
                )?)
            }
            None => None,
        };

        Ok(NetWrapper {
            encoder,
            stage: self.stage,
            projector,
            projection_size: self.projection_size,
            projection_hidden_size: self.projection_hidden_size,
        })
    }
}
