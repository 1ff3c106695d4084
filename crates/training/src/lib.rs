pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod trainer;

pub use config::{TrainingConfig, TrainingError};
pub use data::{ImageDataset, Manifest, PairLoader};
pub use optimizer::Adam;
pub use trainer::Trainer;
