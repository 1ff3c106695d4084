use candle_core::{Error, Result};

/// Supported backbone architectures, selected by name from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Resnet18,
    Resnet34,
    Resnet50,
}

impl Arch {
    /// Parses an architecture name. Unknown names are a configuration error.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "resnet18" => Ok(Arch::Resnet18),
            "resnet34" => Ok(Arch::Resnet34),
            "resnet50" => Ok(Arch::Resnet50),
            other => Err(Error::Msg(format!(
                "unknown backbone architecture '{}'",
                other
            ))),
        }
    }

    /// Residual blocks per stage.
    pub fn blocks(&self) -> [usize; 4] {
        match self {
            Arch::Resnet18 => [2, 2, 2, 2],
            Arch::Resnet34 | Arch::Resnet50 => [3, 4, 6, 3],
        }
    }

    /// Whether stages use the three-convolution bottleneck block.
    pub fn bottleneck(&self) -> bool {
        matches!(self, Arch::Resnet50)
    }

    /// Channel count produced by the global average pool.
    pub fn feature_dim(&self) -> usize {
        if self.bottleneck() {
            512 * resnet_expansion(true)
        } else {
            512
        }
    }
}

pub(crate) fn resnet_expansion(bottleneck: bool) -> usize {
    if bottleneck {
        4
    } else {
        1
    }
}

/// Static encoder configuration.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub arch: Arch,
    /// Input image channels.
    pub in_channels: usize,
    /// Width of the classifier head on top of the pooled features.
    pub num_classes: usize,
}

impl EncoderConfig {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            in_channels: 3,
            num_classes: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_architectures() {
        assert_eq!(Arch::from_name("resnet18").unwrap(), Arch::Resnet18);
        assert_eq!(Arch::from_name("ResNet50").unwrap(), Arch::Resnet50);
    }

    #[test]
    fn rejects_unknown_architecture() {
        assert!(Arch::from_name("vgg16").is_err());
    }

    #[test]
    fn feature_dims() {
        assert_eq!(Arch::Resnet18.feature_dim(), 512);
        assert_eq!(Arch::Resnet50.feature_dim(), 2048);
    }
}
