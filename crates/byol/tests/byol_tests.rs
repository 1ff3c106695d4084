use anyhow::Result;
use byol::{Byol, ByolConfig, LayerSelector, NetWrapper};
use candle_core::{Device, Tensor};
use encoder::{Arch, Encoder, EncoderConfig};

fn small_encoder(device: &Device) -> Result<Encoder> {
    let mut cfg = EncoderConfig::new(Arch::Resnet18);
    cfg.num_classes = 16;
    Ok(Encoder::new(cfg, device)?)
}

fn small_byol_config(image_size: usize) -> ByolConfig {
    ByolConfig {
        image_size,
        hidden_layer: LayerSelector::ByName("avgpool".into()),
        projection_size: 16,
        projection_hidden_size: 32,
        moving_average_decay: 0.99,
    }
}

fn var_values(wrapper: &NetWrapper, name: &str) -> Result<Vec<f32>> {
    let data = wrapper.vars().data().lock().unwrap();
    let var = data.get(name).expect("parameter present");
    Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?)
}

fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| ((x - y) as f64).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[test]
fn unresolved_selector_fails_at_construction() -> Result<()> {
    let device = Device::Cpu;
    let encoder = small_encoder(&device)?;
    let result = NetWrapper::new(encoder, &LayerSelector::ByName("no_such_layer".into()), 16, 32);
    assert!(result.is_err());
    Ok(())
}

#[test]
fn projector_is_built_exactly_once() -> Result<()> {
    let device = Device::Cpu;
    let encoder = small_encoder(&device)?;
    let mut wrapper = NetWrapper::new(encoder, &LayerSelector::ByName("avgpool".into()), 16, 32)?;
    assert!(!wrapper.projector_built());

    let images = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &device)?;
    wrapper.project(&images, true)?;
    assert!(wrapper.projector_built());

    let names_after_first: Vec<String> = {
        let data = wrapper.vars().data().lock().unwrap();
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        names
    };
    let weight_after_first = var_values(&wrapper, "projector.fc1.weight")?;

    wrapper.project(&images, true)?;

    let names_after_second: Vec<String> = {
        let data = wrapper.vars().data().lock().unwrap();
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        names
    };
    let weight_after_second = var_values(&wrapper, "projector.fc1.weight")?;

    // Same parameter set, same (untrained) weights: the cached head was reused.
    assert_eq!(names_after_first, names_after_second);
    assert_eq!(weight_after_first, weight_after_second);
    Ok(())
}

#[test]
fn construction_forces_both_heads_and_target() -> Result<()> {
    let device = Device::Cpu;
    let encoder = small_encoder(&device)?;
    let model = Byol::new(encoder, &small_byol_config(32))?;

    assert!(model.online_encoder().projector_built());
    assert!(model.target_exists());
    assert!(!model.trainable_parameters().is_empty());
    // Target parameters never appear among the trainables.
    for (name, _) in model.trainable_parameters() {
        assert!(name.starts_with("online_"));
    }
    Ok(())
}

#[test]
fn update_without_target_is_a_precondition_error() -> Result<()> {
    let device = Device::Cpu;
    let encoder = small_encoder(&device)?;
    let mut model = Byol::new(encoder, &small_byol_config(32))?;

    model.reset_moving_average();
    assert!(!model.target_exists());
    assert!(model.update_moving_average().is_err());
    Ok(())
}

#[test]
fn ema_update_pulls_target_toward_online() -> Result<()> {
    let device = Device::Cpu;
    let encoder = small_encoder(&device)?;
    let mut model = Byol::new(encoder, &small_byol_config(32))?;

    // Nudge one online weight so the branches diverge.
    {
        let data = model.online_encoder().vars().data().lock().unwrap();
        let var = data.get("conv1.weight").expect("stem weight");
        let nudged = var.as_tensor().affine(1.0, 0.5)?;
        var.set(&nudged)?;
    }

    let online = var_values(model.online_encoder(), "conv1.weight")?;
    let target_before = var_values(model.target_encoder().expect("target"), "conv1.weight")?;
    let distance_before = l2_distance(&online, &target_before);
    assert!(distance_before > 0.0);

    model.update_moving_average()?;

    let target_after = var_values(model.target_encoder().expect("target"), "conv1.weight")?;
    let distance_after = l2_distance(&online, &target_after);
    assert!(
        distance_after < distance_before,
        "EMA should move the target toward the online weights ({} !< {})",
        distance_after,
        distance_before
    );
    Ok(())
}

#[test]
fn reset_then_forward_snapshots_current_online_weights() -> Result<()> {
    let device = Device::Cpu;
    let encoder = small_encoder(&device)?;
    let mut model = Byol::new(encoder, &small_byol_config(32))?;

    {
        let data = model.online_encoder().vars().data().lock().unwrap();
        let var = data.get("conv1.weight").expect("stem weight");
        let nudged = var.as_tensor().affine(1.0, -0.25)?;
        var.set(&nudged)?;
    }

    model.reset_moving_average();
    let images_a = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &device)?;
    let images_b = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &device)?;
    model.forward(&images_a, &images_b)?;

    let online = var_values(model.online_encoder(), "conv1.weight")?;
    let target = var_values(model.target_encoder().expect("target"), "conv1.weight")?;
    assert_eq!(online, target);
    Ok(())
}

#[test]
fn forward_returns_finite_scalar_loss_on_96px_images() -> Result<()> {
    let device = Device::Cpu;
    let encoder = small_encoder(&device)?;
    let mut model = Byol::new(encoder, &small_byol_config(96))?;

    let images_a = Tensor::randn(0f32, 1f32, (2, 3, 96, 96), &device)?;
    let images_b = Tensor::randn(0f32, 1f32, (2, 3, 96, 96), &device)?;

    let loss = model.forward(&images_a, &images_b)?;

    assert!(loss.dims().is_empty(), "loss must be a scalar");
    let value = loss.to_vec0::<f32>()?;
    assert!(value.is_finite());
    assert!(value >= -1e-4, "symmetric BYOL loss is non-negative, got {}", value);
    Ok(())
}
