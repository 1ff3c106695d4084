use byol::{ByolConfig, LayerSelector};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.network.name.trim().is_empty() {
            errors.push("network.name must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.image_size == 0 {
            errors.push("data.image_size must be greater than 0".to_string());
        }

        if self.data.annotation_file.trim().is_empty() {
            errors.push("data.annotation_file must not be empty".to_string());
        }

        if matches!(self.data.pretext, PretextTask::Rotation) {
            match self.data.num_rot {
                Some(2) | Some(4) => {}
                Some(other) => errors.push(format!(
                    "data.num_rot must be 2 or 4 for the rotation pretext (got {})",
                    other
                )),
                None => errors
                    .push("data.num_rot is required when data.pretext is 'rotation'".to_string()),
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if !(0.0..1.0).contains(&self.model.moving_average_decay) {
            errors.push("model.moving_average_decay must be in [0, 1)".to_string());
        }

        if self.model.projection_size == 0 {
            errors.push("model.projection_size must be greater than 0".to_string());
        }

        if self.model.projection_hidden_size == 0 {
            errors.push("model.projection_hidden_size must be greater than 0".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if let Some(checkpoint) = &self.runtime.checkpoint {
            if checkpoint.directory.as_os_str().is_empty() {
                errors.push("runtime.checkpoint.directory must not be empty".to_string());
            }
            if checkpoint.every_n_epochs == 0 {
                errors.push("runtime.checkpoint.every_n_epochs must be greater than 0".to_string());
            }
            if let Some(0) = checkpoint.max_keep {
                errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
            }
        }

        if self.runtime.logging.tensorboard_flush_every_n == 0 {
            errors.push(
                "runtime.logging.tensorboard_flush_every_n must be greater than 0".to_string(),
            );
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_network_name")]
    pub name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: default_network_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub root_path: PathBuf,
    #[serde(default)]
    pub data_path: Option<PathBuf>,
    #[serde(default = "default_labels_dir")]
    pub labels_dir: String,
    #[serde(default = "default_annotation_file")]
    pub annotation_file: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default)]
    pub pretext: PretextTask,
    #[serde(default)]
    pub num_rot: Option<usize>,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.root_path, base);
        if let Some(data_path) = self.data_path.as_mut() {
            absolutize_in_place(data_path, base);
        }
    }

    /// Directory holding the image files the manifest refers to.
    pub fn images_root(&self) -> PathBuf {
        self.data_path
            .clone()
            .unwrap_or_else(|| self.root_path.clone())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root_path
            .join(&self.labels_dir)
            .join(&self.annotation_file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PretextTask {
    Byol,
    Rotation,
}

impl Default for PretextTask {
    fn default() -> Self {
        Self::Byol
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_hidden_layer")]
    pub hidden_layer: HiddenLayer,
    #[serde(default = "default_projection_size")]
    pub projection_size: usize,
    #[serde(default = "default_projection_hidden_size")]
    pub projection_hidden_size: usize,
    #[serde(default = "default_moving_average_decay")]
    pub moving_average_decay: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_layer: default_hidden_layer(),
            projection_size: default_projection_size(),
            projection_hidden_size: default_projection_hidden_size(),
            moving_average_decay: default_moving_average_decay(),
        }
    }
}

impl ModelConfig {
    pub fn to_byol_config(&self, image_size: usize) -> ByolConfig {
        ByolConfig {
            image_size,
            hidden_layer: self.hidden_layer.to_selector(),
            projection_size: self.projection_size,
            projection_hidden_size: self.projection_hidden_size,
            moving_average_decay: self.moving_average_decay,
        }
    }
}

/// Which encoder stage feeds the projector. Accepts either a (possibly
/// negative) stage index or a stage name; `"output"` selects the final
/// classifier output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HiddenLayer {
    Index(i64),
    Name(String),
}

impl HiddenLayer {
    pub fn to_selector(&self) -> LayerSelector {
        match self {
            HiddenLayer::Index(idx) => LayerSelector::ByIndex(*idx),
            HiddenLayer::Name(name) if name == "output" => LayerSelector::Output,
            HiddenLayer::Name(name) => LayerSelector::ByName(name.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            epochs: default_epochs(),
            log_every_n_steps: default_log_every_n_steps(),
            checkpoint: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            checkpoint.apply_base_path(base);
        }
        self.logging.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub directory: PathBuf,
    #[serde(default = "default_checkpoint_every_n_epochs")]
    pub every_n_epochs: usize,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

impl CheckpointConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.directory, base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

impl LoggingConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(tensorboard) = self.tensorboard.as_mut() {
            absolutize_in_place(tensorboard, base);
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_network_name() -> String {
    "resnet50".to_string()
}

fn default_labels_dir() -> String {
    "annotations".to_string()
}

fn default_annotation_file() -> String {
    "stl.csv".to_string()
}

fn default_batch_size() -> usize {
    64
}

fn default_image_size() -> usize {
    96
}

fn default_hidden_layer() -> HiddenLayer {
    HiddenLayer::Index(-2)
}

fn default_projection_size() -> usize {
    256
}

fn default_projection_hidden_size() -> usize {
    4096
}

fn default_moving_average_decay() -> f64 {
    0.99
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_seed() -> u64 {
    0
}

fn default_epochs() -> usize {
    100
}

fn default_log_every_n_steps() -> usize {
    1
}

fn default_checkpoint_every_n_epochs() -> usize {
    100
}

fn default_enable_stdout() -> bool {
    true
}

fn default_tensorboard_flush_every_n() -> usize {
    20
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<csv::Error> for TrainingError {
    fn from(value: csv::Error) -> Self {
        TrainingError::Runtime(format!("manifest error: {}", value))
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [data]
            root_path = "data/stl10"
        "#
    }

    #[test]
    fn defaults_match_reference_recipe() {
        let config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.network.name, "resnet50");
        assert_eq!(config.data.batch_size, 64);
        assert_eq!(config.data.image_size, 96);
        assert_eq!(config.model.projection_size, 256);
        assert_eq!(config.model.projection_hidden_size, 4096);
        assert!((config.model.moving_average_decay - 0.99).abs() < 1e-12);
        assert!((config.optimizer.learning_rate - 1e-4).abs() < 1e-12);
        assert_eq!(config.runtime.seed, 0);
        assert_eq!(config.runtime.epochs, 100);
    }

    #[test]
    fn hidden_layer_accepts_index_and_name() {
        let by_index: TrainingConfig = toml::from_str(
            r#"
                [data]
                root_path = "data"
                [model]
                hidden_layer = -2
            "#,
        )
        .unwrap();
        assert!(matches!(
            by_index.model.hidden_layer.to_selector(),
            LayerSelector::ByIndex(-2)
        ));

        let by_name: TrainingConfig = toml::from_str(
            r#"
                [data]
                root_path = "data"
                [model]
                hidden_layer = "avgpool"
            "#,
        )
        .unwrap();
        assert!(matches!(
            by_name.model.hidden_layer.to_selector(),
            LayerSelector::ByName(name) if name == "avgpool"
        ));

        let output: TrainingConfig = toml::from_str(
            r#"
                [data]
                root_path = "data"
                [model]
                hidden_layer = "output"
            "#,
        )
        .unwrap();
        assert!(matches!(
            output.model.hidden_layer.to_selector(),
            LayerSelector::Output
        ));
    }

    #[test]
    fn validate_collects_all_errors() {
        let mut config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        config.data.batch_size = 0;
        config.optimizer.learning_rate = 0.0;
        config.model.moving_average_decay = 1.0;

        let err = config.validate().unwrap_err();
        match err {
            TrainingError::Validation(messages) => {
                assert!(messages.iter().any(|m| m.contains("batch_size")));
                assert!(messages.iter().any(|m| m.contains("learning_rate")));
                assert!(messages.iter().any(|m| m.contains("moving_average_decay")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn rotation_pretext_requires_supported_num_rot() {
        let mut config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        config.data.pretext = PretextTask::Rotation;
        config.data.num_rot = None;
        assert!(config.validate().is_err());

        config.data.num_rot = Some(3);
        assert!(config.validate().is_err());

        config.data.num_rot = Some(4);
        assert!(config.validate().is_ok());
    }
}
