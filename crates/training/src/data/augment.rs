use crate::config::TrainingError;
use image::{imageops, imageops::FilterType, DynamicImage, RgbImage};
use rand::{rngs::StdRng, Rng};

const CROP_SCALE: (f32, f32) = (0.2, 1.0);
const CROP_RATIO: (f32, f32) = (3.0 / 4.0, 4.0 / 3.0);
const FLIP_PROB: f64 = 0.5;
const JITTER_PROB: f64 = 0.8;
const GRAYSCALE_PROB: f64 = 0.2;
const BLUR_PROB: f64 = 0.5;
const BLUR_SIGMA: (f32, f32) = (0.1, 2.0);

/// The SimCLR-style augmentation pipeline used to produce the two views
/// of each training image: random resized crop, horizontal flip, color
/// jitter, random grayscale, and gaussian blur.
pub struct SimclrAugment {
    image_size: u32,
}

impl SimclrAugment {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size: image_size as u32,
        }
    }

    pub fn apply(&self, image: &RgbImage, rng: &mut StdRng) -> RgbImage {
        let mut view = random_resized_crop(image, self.image_size, rng);

        if rng.gen_bool(FLIP_PROB) {
            view = imageops::flip_horizontal(&view);
        }

        if rng.gen_bool(JITTER_PROB) {
            let brightness = rng.gen_range(-32i32..=32);
            view = imageops::brighten(&view, brightness);
            let contrast = rng.gen_range(-20f32..=20f32);
            view = imageops::contrast(&view, contrast);
        }

        if rng.gen_bool(GRAYSCALE_PROB) {
            let gray = imageops::grayscale(&view);
            view = DynamicImage::ImageLuma8(gray).to_rgb8();
        }

        if rng.gen_bool(BLUR_PROB) {
            let sigma = rng.gen_range(BLUR_SIGMA.0..=BLUR_SIGMA.1);
            view = imageops::blur(&view, sigma);
        }

        view
    }
}

fn random_resized_crop(image: &RgbImage, size: u32, rng: &mut StdRng) -> RgbImage {
    let (width, height) = image.dimensions();
    let area = (width * height) as f32;

    for _ in 0..10 {
        let target_area = area * rng.gen_range(CROP_SCALE.0..=CROP_SCALE.1);
        let aspect = rng.gen_range(CROP_RATIO.0..=CROP_RATIO.1);
        let crop_w = (target_area * aspect).sqrt().round() as u32;
        let crop_h = (target_area / aspect).sqrt().round() as u32;
        if crop_w == 0 || crop_h == 0 || crop_w > width || crop_h > height {
            continue;
        }
        let x = rng.gen_range(0..=width - crop_w);
        let y = rng.gen_range(0..=height - crop_h);
        let crop = imageops::crop_imm(image, x, y, crop_w, crop_h).to_image();
        return imageops::resize(&crop, size, size, FilterType::Triangle);
    }

    // Fallback when sampling keeps producing out-of-bounds crops.
    imageops::resize(image, size, size, FilterType::Triangle)
}

/// View generation for the rotation pretext: each view is the image
/// resized to the training resolution and rotated by a random multiple
/// of 90 degrees. `num_rot` of 2 restricts to {0, 180} degrees.
pub struct RotationAugment {
    num_rot: usize,
    image_size: u32,
}

impl RotationAugment {
    pub fn new(num_rot: usize, image_size: usize) -> Result<Self, TrainingError> {
        if num_rot != 2 && num_rot != 4 {
            return Err(TrainingError::initialization(format!(
                "rotation pretext supports 2 or 4 rotations (got {})",
                num_rot
            )));
        }
        Ok(Self {
            num_rot,
            image_size: image_size as u32,
        })
    }

    pub fn apply(&self, image: &RgbImage, rng: &mut StdRng) -> RgbImage {
        let resized = imageops::resize(
            image,
            self.image_size,
            self.image_size,
            FilterType::Triangle,
        );
        let step = rng.gen_range(0..self.num_rot);
        let quarter_turns = if self.num_rot == 2 { step * 2 } else { step };
        match quarter_turns % 4 {
            0 => resized,
            1 => imageops::rotate90(&resized),
            2 => imageops::rotate180(&resized),
            _ => imageops::rotate270(&resized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 3) as u8, (y * 7) as u8, 128])
        })
    }

    #[test]
    fn simclr_views_have_target_resolution() {
        let augment = SimclrAugment::new(32);
        let image = gradient_image(96, 96);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..8 {
            let view = augment.apply(&image, &mut rng);
            assert_eq!(view.dimensions(), (32, 32));
        }
    }

    #[test]
    fn rotation_rejects_unsupported_counts() {
        assert!(RotationAugment::new(3, 32).is_err());
        assert!(RotationAugment::new(2, 32).is_ok());
        assert!(RotationAugment::new(4, 32).is_ok());
    }

    #[test]
    fn rotation_views_keep_resolution() {
        let augment = RotationAugment::new(4, 24).unwrap();
        let image = gradient_image(96, 96);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..8 {
            let view = augment.apply(&image, &mut rng);
            assert_eq!(view.dimensions(), (24, 24));
        }
    }
}
