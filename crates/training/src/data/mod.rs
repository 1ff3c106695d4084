pub mod augment;
pub mod preprocess;

use crate::config::{PretextTask, TrainingError};
use augment::{RotationAugment, SimclrAugment};
use candle_core::{Device, Tensor};
use image::RgbImage;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::path::Path;

/// One row of an annotation manifest. `label` and `class_name` are only
/// present when the manifest carries supervised columns.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub filename: String,
    pub label: Option<i64>,
    pub class_name: Option<String>,
}

/// A CSV annotation manifest. The `Filename` column is required; `Label`
/// and `ClassName` are optional. Indexing wraps modulo the manifest
/// length so a sampler can run past the end without bounds checks.
#[derive(Debug, Clone)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();

        let filename_col = headers
            .iter()
            .position(|h| h == "Filename")
            .ok_or_else(|| {
                TrainingError::runtime(format!(
                    "manifest {} is missing the required 'Filename' column",
                    path.display()
                ))
            })?;
        let label_col = headers.iter().position(|h| h == "Label");
        let class_col = headers.iter().position(|h| h == "ClassName");

        let mut entries = Vec::new();
        for record in reader.records() {
            let record = record?;
            let filename = record
                .get(filename_col)
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .ok_or_else(|| {
                    TrainingError::runtime(format!(
                        "manifest {} contains a row with an empty filename",
                        path.display()
                    ))
                })?
                .to_string();

            let label = match label_col.and_then(|col| record.get(col)) {
                Some(raw) if !raw.trim().is_empty() => {
                    Some(raw.trim().parse::<i64>().map_err(|_| {
                        TrainingError::runtime(format!(
                            "manifest {} has a non-integer label '{}' for {}",
                            path.display(),
                            raw,
                            filename
                        ))
                    })?)
                }
                _ => None,
            };

            let class_name = class_col
                .and_then(|col| record.get(col))
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string);

            entries.push(ManifestEntry {
                filename,
                label,
                class_name,
            });
        }

        if entries.is_empty() {
            return Err(TrainingError::runtime(format!(
                "manifest {} contains no rows",
                path.display()
            )));
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> &ManifestEntry {
        &self.entries[index % self.entries.len()]
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }
}

/// In-memory image dataset backed by a manifest. All images are decoded
/// up front; STL-sized corpora fit comfortably in RAM and the training
/// loop revisits every image each epoch.
pub struct ImageDataset {
    images: Vec<RgbImage>,
    manifest: Manifest,
}

impl ImageDataset {
    pub fn load(manifest: Manifest, images_root: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let images_root = images_root.as_ref();
        let mut images = Vec::with_capacity(manifest.len());
        for entry in manifest.entries() {
            let path = images_root.join(&entry.filename);
            let image = image::open(&path)
                .map_err(|err| {
                    TrainingError::runtime(format!(
                        "failed to decode image {}: {}",
                        path.display(),
                        err
                    ))
                })?
                .to_rgb8();
            images.push(image);
        }
        Ok(Self { images, manifest })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn get(&self, index: usize) -> &RgbImage {
        &self.images[index % self.images.len()]
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

enum ViewAugment {
    Simclr(SimclrAugment),
    Rotation(RotationAugment),
}

impl ViewAugment {
    fn apply(&self, image: &RgbImage, rng: &mut StdRng) -> RgbImage {
        match self {
            ViewAugment::Simclr(augment) => augment.apply(image, rng),
            ViewAugment::Rotation(augment) => augment.apply(image, rng),
        }
    }
}

/// Yields batches of paired augmented views, each a `(B, 3, S, S)` f32
/// tensor. Every epoch reshuffles with a seed derived from the base seed
/// and the epoch index, so runs are reproducible while epochs differ.
/// Trailing partial batches are dropped.
pub struct PairLoader {
    dataset: ImageDataset,
    augment: ViewAugment,
    batch_size: usize,
    image_size: usize,
    seed: u64,
    device: Device,
}

impl PairLoader {
    pub fn new(
        dataset: ImageDataset,
        pretext: PretextTask,
        num_rot: Option<usize>,
        batch_size: usize,
        image_size: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self, TrainingError> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "pair loader batch size must be greater than zero",
            ));
        }
        let augment = match pretext {
            PretextTask::Byol => ViewAugment::Simclr(SimclrAugment::new(image_size)),
            PretextTask::Rotation => {
                let num_rot = num_rot.ok_or_else(|| {
                    TrainingError::initialization(
                        "the rotation pretext requires data.num_rot to be set",
                    )
                })?;
                ViewAugment::Rotation(RotationAugment::new(num_rot, image_size)?)
            }
        };
        Ok(Self {
            dataset,
            augment,
            batch_size,
            image_size,
            seed,
            device,
        })
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    pub fn dataset(&self) -> &ImageDataset {
        &self.dataset
    }

    pub fn epoch(&self, epoch: usize) -> EpochBatches<'_> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        indices.shuffle(&mut rng);
        EpochBatches {
            loader: self,
            indices,
            cursor: 0,
            rng,
        }
    }
}

pub struct EpochBatches<'a> {
    loader: &'a PairLoader,
    indices: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl EpochBatches<'_> {
    fn build_batch(&mut self, start: usize) -> Result<(Tensor, Tensor), TrainingError> {
        let loader = self.loader;
        let mut views_a = Vec::with_capacity(loader.batch_size);
        let mut views_b = Vec::with_capacity(loader.batch_size);
        for offset in 0..loader.batch_size {
            let image = loader.dataset.get(self.indices[start + offset]);
            let view_a = loader.augment.apply(image, &mut self.rng);
            let view_b = loader.augment.apply(image, &mut self.rng);
            views_a.push(image_to_tensor(&view_a, &loader.device)?);
            views_b.push(image_to_tensor(&view_b, &loader.device)?);
        }
        let batch_a = Tensor::stack(&views_a, 0)?;
        let batch_b = Tensor::stack(&views_b, 0)?;
        debug_assert_eq!(
            batch_a.dims(),
            &[
                loader.batch_size,
                3,
                loader.image_size,
                loader.image_size
            ]
        );
        Ok((batch_a, batch_b))
    }
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<(Tensor, Tensor), TrainingError>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.cursor;
        if start + self.loader.batch_size > self.indices.len() {
            return None;
        }
        self.cursor += self.loader.batch_size;
        Some(self.build_batch(start))
    }
}

/// Converts an RGB image to a `(3, H, W)` f32 tensor scaled to `[0, 1]`.
pub fn image_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor, TrainingError> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for channel in 0..3 {
            data[channel * plane + offset] = pixel.0[channel] as f32 / 255.0;
        }
    }
    Ok(Tensor::from_vec(
        data,
        (3, height as usize, width as usize),
        device,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn image_to_tensor_is_chw_and_unit_scaled() {
        let mut image = RgbImage::new(4, 2);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        image.put_pixel(3, 1, Rgb([0, 0, 128]));

        let tensor = image_to_tensor(&image, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, 2, 4]);

        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // red channel, pixel (0, 0)
        assert!((values[0] - 1.0).abs() < 1e-6);
        // blue channel, pixel (3, 1)
        assert!((values[2 * 8 + 7] - 128.0 / 255.0).abs() < 1e-6);
    }
}
