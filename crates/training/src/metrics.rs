use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    images_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            images_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
            grad_norm_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, images: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.images_processed = self.images_processed.saturating_add(images);
        let step_images_per_sec = if step_duration > Duration::ZERO {
            images as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };
        let loss_avg = self.loss_ema.update(loss);
        let throughput_avg = self.throughput_ema.update(step_images_per_sec);
        let grad_norm_avg = self.grad_norm_ema.update(grad_norm);

        StepSnapshot {
            loss: loss_avg,
            step_loss: loss,
            images,
            step_images_per_sec,
            images_per_sec: throughput_avg,
            grad_norm: grad_norm_avg,
            raw_grad_norm: grad_norm,
            total_images: self.images_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub step_loss: f64,
    pub images: u64,
    pub step_images_per_sec: f64,
    pub images_per_sec: f64,
    pub grad_norm: f64,
    pub raw_grad_norm: f64,
    pub total_images: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_seeds_with_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.1);
        assert!(ema.value().is_none());
        assert!((ema.update(4.0) - 4.0).abs() < 1e-12);
        let next = ema.update(2.0);
        assert!((next - (0.1 * 2.0 + 0.9 * 4.0)).abs() < 1e-12);
    }

    #[test]
    fn record_step_accumulates_image_totals() {
        let mut metrics = TrainingMetrics::new();
        let first = metrics.record_step(64, 3.5, 1.0);
        assert_eq!(first.total_images, 64);
        assert!((first.step_loss - 3.5).abs() < 1e-12);

        let second = metrics.record_step(64, 3.0, 1.0);
        assert_eq!(second.total_images, 128);
        assert!(second.loss < first.loss);
    }
}
