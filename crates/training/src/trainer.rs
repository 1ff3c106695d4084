use std::path::PathBuf;

use byol::Byol;
use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use encoder::{Arch, Encoder, EncoderConfig};

use crate::{
    checkpoint::{self, SaveRequest},
    data::{ImageDataset, Manifest, PairLoader},
    logging::{Logger, LoggingSettings},
    metrics::TrainingMetrics,
    optimizer::Adam,
    TrainingConfig, TrainingError,
};

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    model: Byol,
    optimizer: Adam,
    loader: PairLoader,
    metrics: TrainingMetrics,
    logger: Logger,
    checkpoint: Option<CheckpointSettings>,
    log_every: usize,
    optimizer_steps: usize,
}

#[derive(Debug, Clone)]
struct CheckpointSettings {
    directory: PathBuf,
    every_n_epochs: usize,
    max_keep: Option<usize>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = detect_device();
        // The CPU backend does not support reseeding.
        if !matches!(device, Device::Cpu) {
            device
                .set_seed(config.runtime.seed)
                .map_err(|err| TrainingError::initialization(err.to_string()))?;
        }

        let manifest = Manifest::from_csv(config.data.manifest_path())?;
        println!(
            "loaded manifest {} with {} rows",
            config.data.manifest_path().display(),
            manifest.len()
        );
        let dataset = ImageDataset::load(manifest, config.data.images_root())?;
        let loader = PairLoader::new(
            dataset,
            config.data.pretext,
            config.data.num_rot,
            config.data.batch_size,
            config.data.image_size,
            config.runtime.seed,
            device.clone(),
        )?;
        if loader.batches_per_epoch() == 0 {
            return Err(TrainingError::initialization(format!(
                "dataset has {} images, fewer than one batch of {}",
                loader.dataset().len(),
                config.data.batch_size
            )));
        }

        let arch = Arch::from_name(&config.network.name)
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        let encoder = Encoder::new(EncoderConfig::new(arch), &device)
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        let model = Byol::new(encoder, &config.model.to_byol_config(config.data.image_size))
            .map_err(|err| TrainingError::initialization(err.to_string()))?;

        let optimizer = Adam::new(model.trainable_parameters(), config.optimizer.clone())?;

        let logger = Logger::new(LoggingSettings::from_config(
            config.runtime.logging.enable_stdout,
            config.runtime.logging.tensorboard.clone(),
            config.runtime.logging.tensorboard_flush_every_n,
        ))?;

        let checkpoint = config
            .runtime
            .checkpoint
            .as_ref()
            .map(|cfg| CheckpointSettings {
                directory: cfg.directory.clone(),
                every_n_epochs: cfg.every_n_epochs,
                max_keep: cfg.max_keep,
            });

        let log_every = config.runtime.log_every_n_steps;

        Ok(Self {
            config,
            device,
            model,
            optimizer,
            loader,
            metrics: TrainingMetrics::new(),
            logger,
            checkpoint,
            log_every,
            optimizer_steps: 0,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &Byol {
        &self.model
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs the full training loop. `should_stop` is polled once per
    /// step; when it returns true, a final checkpoint is written and
    /// the loop exits cleanly.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        let epochs = self.config.runtime.epochs;
        let batch_size = self.config.data.batch_size;
        let mut last_saved_epoch = None;
        let mut stopping = false;

        for epoch in 0..epochs {
            let mut epoch_loss = 0.0;
            let mut epoch_batches = 0usize;

            let mut batches = self.loader.epoch(epoch);
            while let Some(batch) = batches.next() {
                if should_stop() {
                    stopping = true;
                    break;
                }
                let (view_a, view_b) = batch?;

                let loss = self.model.forward(&view_a, &view_b)?;
                let loss_value = loss.to_vec0::<f32>()? as f64;
                let mut grads = loss.backward()?;
                let grad_norm = self.optimizer.step(&mut grads)?;
                self.model.update_moving_average()?;

                self.optimizer_steps += 1;
                epoch_loss += loss_value;
                epoch_batches += 1;

                let snapshot = self
                    .metrics
                    .record_step(batch_size as u64, loss_value, grad_norm);
                if self.optimizer_steps % self.log_every == 0 {
                    self.logger.log_training_step(
                        self.optimizer_steps,
                        self.optimizer.learning_rate(),
                        &snapshot,
                    );
                }
            }

            if epoch_batches > 0 {
                self.logger
                    .log_epoch(epoch, epochs, epoch_loss / epoch_batches as f64);
            }

            if stopping {
                println!("shutdown requested, stopping after epoch {}", epoch + 1);
                self.save_checkpoint(epoch)?;
                last_saved_epoch = Some(epoch);
                break;
            }

            if let Some(settings) = &self.checkpoint {
                if (epoch + 1) % settings.every_n_epochs == 0 {
                    self.save_checkpoint(epoch)?;
                    last_saved_epoch = Some(epoch);
                }
            }
        }

        if !stopping && last_saved_epoch != Some(epochs - 1) {
            self.save_checkpoint(epochs - 1)?;
        }
        self.logger.flush();
        Ok(())
    }

    fn save_checkpoint(&self, epoch: usize) -> Result<(), TrainingError> {
        let Some(settings) = &self.checkpoint else {
            return Ok(());
        };
        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            base_dir: &settings.directory,
            config: &self.config,
            network: self.model.online_encoder(),
            epoch,
            optimizer_step: self.optimizer_steps,
            max_keep: settings.max_keep,
        })?;
        println!("saved checkpoint {}", descriptor.directory.display());
        Ok(())
    }
}

fn detect_device() -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    println!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available, metal_available
    );

    if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                println!("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => {
                eprintln!("failed to initialize cuda device, falling back: {}", err);
            }
        }
    }
    if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                println!("device: using Metal GPU #0");
                return device;
            }
            Err(err) => {
                eprintln!("failed to initialize metal device, falling back: {}", err);
            }
        }
    }
    println!("device: using CPU");
    Device::Cpu
}
