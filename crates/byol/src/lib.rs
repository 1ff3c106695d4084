//! Bootstrap Your Own Latent (BYOL) on top of the encoder crate.
//!
//! Two copies of a wrapped backbone are maintained: the online branch trained
//! by gradient descent, and a target branch that only ever receives
//! exponential-moving-average copies of the online weights. The loss compares
//! predictor outputs of one view against stop-gradient target projections of
//! the other view.

pub mod ema;
pub mod loss;
pub mod mlp;
pub mod model;
pub mod wrapper;

pub use ema::Ema;
pub use loss::regression_loss;
pub use mlp::Mlp;
pub use model::{Byol, ByolConfig};
pub use wrapper::{named_vars, LayerSelector, NetWrapper};
