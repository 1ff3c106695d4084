//! Convolutional backbone encoders assembled from Candle primitives.
//!
//! The encoders expose their top-level stages by name so callers can stop a
//! forward pass at an intermediate stage and read its activations, which is
//! what self-supervised heads attach to.

pub mod config;
pub mod resnet;

pub use config::{Arch, EncoderConfig};
pub use resnet::{Encoder, Stage};
