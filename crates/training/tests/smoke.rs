use std::{fs, path::Path};

use byol::{Byol, ByolConfig, LayerSelector};
use candle_core::Device;
use encoder::{Arch, Encoder, EncoderConfig};
use image::{Rgb, RgbImage};
use tempfile::tempdir;
use training::{
    checkpoint::{self, SaveRequest},
    config::{
        CheckpointConfig, DataConfig, HiddenLayer, LoggingConfig, ModelConfig, NetworkConfig,
        OptimizerConfig, PretextTask, RuntimeConfig,
    },
    data::{preprocess::ManifestBuilder, ImageDataset, Manifest, PairLoader},
    Trainer, TrainingConfig,
};

fn write_image(path: &Path, seed: u32) {
    let image = RgbImage::from_fn(24, 24, |x, y| {
        Rgb([
            ((x * 7 + seed) % 256) as u8,
            ((y * 11 + seed * 3) % 256) as u8,
            ((x + y + seed * 5) % 256) as u8,
        ])
    });
    image.save(path).expect("write test image");
}

fn write_dataset(root: &Path, count: usize) -> std::path::PathBuf {
    let images_dir = root.join("images");
    let labels_dir = root.join("annotations");
    fs::create_dir_all(&images_dir).unwrap();
    fs::create_dir_all(&labels_dir).unwrap();

    let mut rows = String::from("Filename,Label,ClassName\n");
    for i in 0..count {
        let filename = format!("img_{i:03}.png");
        write_image(&images_dir.join(&filename), i as u32);
        rows.push_str(&format!("{},{},class_{}\n", filename, i % 2, i % 2));
    }
    let manifest_path = labels_dir.join("stl.csv");
    fs::write(&manifest_path, rows).unwrap();
    manifest_path
}

#[test]
fn manifest_len_matches_rows_and_indexing_wraps() {
    let dir = tempdir().unwrap();
    let manifest_path = write_dataset(dir.path(), 10);

    let manifest = Manifest::from_csv(&manifest_path).unwrap();
    assert_eq!(manifest.len(), 10);
    assert_eq!(
        manifest.get(manifest.len() + 3).filename,
        manifest.get(3).filename
    );
    assert_eq!(manifest.get(3).label, Some(1));
    assert_eq!(manifest.get(4).class_name.as_deref(), Some("class_0"));
}

#[test]
fn manifest_requires_filename_column() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.csv");
    fs::write(&path, "Label,ClassName\n0,cat\n").unwrap();
    assert!(Manifest::from_csv(&path).is_err());
}

#[test]
fn pair_loader_yields_paired_view_batches_and_drops_partials() {
    let dir = tempdir().unwrap();
    let manifest_path = write_dataset(dir.path(), 10);

    let manifest = Manifest::from_csv(&manifest_path).unwrap();
    let dataset = ImageDataset::load(manifest, dir.path().join("images")).unwrap();
    let loader = PairLoader::new(
        dataset,
        PretextTask::Byol,
        None,
        4,
        16,
        0,
        Device::Cpu,
    )
    .unwrap();

    // 10 images at batch size 4 leaves a partial batch of 2, which is dropped.
    assert_eq!(loader.batches_per_epoch(), 2);
    let batches: Vec<_> = loader.epoch(0).collect::<Result<_, _>>().unwrap();
    assert_eq!(batches.len(), 2);
    for (view_a, view_b) in &batches {
        assert_eq!(view_a.dims(), &[4, 3, 16, 16]);
        assert_eq!(view_b.dims(), &[4, 3, 16, 16]);
    }
}

#[test]
fn pair_loader_epochs_are_seeded() {
    let dir = tempdir().unwrap();
    let manifest_path = write_dataset(dir.path(), 8);

    let manifest = Manifest::from_csv(&manifest_path).unwrap();
    let dataset = ImageDataset::load(manifest, dir.path().join("images")).unwrap();
    let loader = PairLoader::new(
        dataset,
        PretextTask::Byol,
        None,
        4,
        16,
        7,
        Device::Cpu,
    )
    .unwrap();

    let first: Vec<_> = loader.epoch(0).collect::<Result<_, _>>().unwrap();
    let replay: Vec<_> = loader.epoch(0).collect::<Result<_, _>>().unwrap();
    let a = first[0].0.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let b = replay[0].0.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(a, b);
}

#[test]
fn manifest_builder_splits_per_class() {
    let dir = tempdir().unwrap();
    let images_root = dir.path().join("raw");
    for class in ["cat", "dog"] {
        let class_dir = images_root.join(class);
        fs::create_dir_all(&class_dir).unwrap();
        for i in 0..12 {
            write_image(&class_dir.join(format!("{class}_{i:02}.png")), i);
        }
    }

    let output = dir.path().join("annotations");
    let mut builder = ManifestBuilder::new(&images_root, &output);
    builder.num_test_per_class = 4;
    builder.labeled_fraction = 0.25;

    let summary = builder.run().unwrap();
    assert_eq!(summary.classes, vec!["cat".to_string(), "dog".to_string()]);
    assert_eq!(summary.test_rows, 8);
    assert_eq!(summary.train_rows, 16);
    assert_eq!(summary.labeled_rows, 4);

    let train = Manifest::from_csv(output.join("stl.csv")).unwrap();
    assert_eq!(train.len(), 16);
    assert!(train
        .entries()
        .iter()
        .all(|entry| entry.label.is_some() && entry.class_name.is_some()));

    let test = Manifest::from_csv(output.join("test.csv")).unwrap();
    assert_eq!(test.len(), 8);
}

#[test]
fn config_validation_rejects_zero_batch_size() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("train.toml");
    fs::write(
        &config_path,
        r#"
            [data]
            root_path = "data"
            batch_size = 0
        "#,
    )
    .unwrap();

    let err = TrainingConfig::from_path(&config_path).unwrap_err();
    assert!(err.to_string().contains("batch_size"));
}

#[test]
fn checkpoint_round_trip_restores_backbone_weights() {
    let dir = tempdir().unwrap();
    let device = Device::Cpu;

    let config = small_training_config(dir.path());
    let byol_config = ByolConfig {
        image_size: 16,
        hidden_layer: LayerSelector::ByIndex(-2),
        projection_size: 8,
        projection_hidden_size: 16,
        moving_average_decay: 0.99,
    };
    let encoder = Encoder::new(EncoderConfig::new(Arch::Resnet18), &device).unwrap();
    let model = Byol::new(encoder, &byol_config).unwrap();

    let descriptor = checkpoint::save_checkpoint(SaveRequest {
        base_dir: &dir.path().join("checkpoints"),
        config: &config,
        network: model.online_encoder(),
        epoch: 0,
        optimizer_step: 5,
        max_keep: None,
    })
    .unwrap();
    assert_eq!(descriptor.manifest.epoch, 0);
    assert_eq!(descriptor.manifest.optimizer_step, 5);

    let latest = checkpoint::latest_checkpoint(&dir.path().join("checkpoints"))
        .unwrap()
        .expect("checkpoint present");
    let outcome = checkpoint::load_checkpoint(&latest.directory).unwrap();

    // A fresh network has different random weights; loading must make
    // them match the saved ones exactly.
    let fresh_encoder = Encoder::new(EncoderConfig::new(Arch::Resnet18), &device).unwrap();
    let fresh = Byol::new(fresh_encoder, &byol_config).unwrap();
    checkpoint::apply_encoder_weights(
        fresh.online_encoder(),
        &outcome.encoder_weights_path,
        &device,
    )
    .unwrap();

    let saved = model.online_encoder().encoder_vars();
    let loaded = fresh.online_encoder().encoder_vars();
    assert_eq!(saved.len(), loaded.len());
    for ((name_a, var_a), (name_b, var_b)) in saved.iter().zip(loaded.iter()) {
        assert_eq!(name_a, name_b);
        let a = var_a
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let b = var_b
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(a, b, "weights differ for {name_a}");
    }
}

#[test]
fn trainer_runs_an_epoch_and_writes_a_checkpoint() {
    let dir = tempdir().unwrap();
    write_dataset(dir.path(), 4);

    let config = small_training_config(dir.path());
    let mut trainer = Trainer::new(config).unwrap();
    trainer.train().unwrap();

    let checkpoints = checkpoint::latest_checkpoint(&dir.path().join("checkpoints"))
        .unwrap()
        .expect("final checkpoint written");
    assert!(checkpoints
        .directory
        .join(&checkpoints.manifest.encoder.filename)
        .is_file());
}

fn small_training_config(root: &Path) -> TrainingConfig {
    TrainingConfig {
        network: NetworkConfig {
            name: "resnet18".to_string(),
        },
        data: DataConfig {
            root_path: root.to_path_buf(),
            data_path: Some(root.join("images")),
            labels_dir: "annotations".to_string(),
            annotation_file: "stl.csv".to_string(),
            batch_size: 2,
            image_size: 16,
            pretext: PretextTask::Byol,
            num_rot: None,
        },
        model: ModelConfig {
            hidden_layer: HiddenLayer::Index(-2),
            projection_size: 8,
            projection_hidden_size: 16,
            moving_average_decay: 0.99,
        },
        optimizer: OptimizerConfig::default(),
        runtime: RuntimeConfig {
            seed: 0,
            epochs: 1,
            log_every_n_steps: 1,
            checkpoint: Some(CheckpointConfig {
                directory: root.join("checkpoints"),
                every_n_epochs: 1,
                max_keep: Some(2),
            }),
            logging: LoggingConfig {
                enable_stdout: false,
                tensorboard: None,
                tensorboard_flush_every_n: 20,
            },
        },
    }
}
