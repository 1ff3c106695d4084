use crate::config::TrainingError;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    fs,
    path::{Path, PathBuf},
};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Builds the annotation manifests for a class-per-subdirectory image
/// tree. For every class a fixed number of images is held out for the
/// test split; the remainder becomes the training manifest, and a
/// fraction of it is sampled into a labeled subset for downstream
/// evaluation.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    pub images_root: PathBuf,
    pub output_dir: PathBuf,
    pub num_test_per_class: usize,
    pub labeled_fraction: f64,
    pub seed: u64,
}

impl ManifestBuilder {
    pub fn new(images_root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_root: images_root.into(),
            output_dir: output_dir.into(),
            num_test_per_class: 60,
            labeled_fraction: 0.25,
            seed: 0,
        }
    }

    pub fn run(&self) -> Result<ManifestSummary, TrainingError> {
        if !(0.0..=1.0).contains(&self.labeled_fraction) {
            return Err(TrainingError::initialization(format!(
                "labeled_fraction must be in [0, 1] (got {})",
                self.labeled_fraction
            )));
        }

        let classes = self.discover_classes()?;
        if classes.is_empty() {
            return Err(TrainingError::runtime(format!(
                "no class subdirectories found under {}",
                self.images_root.display()
            )));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut train_rows = Vec::new();
        let mut test_rows = Vec::new();
        let mut labeled_rows = Vec::new();

        for (label, class_name) in classes.iter().enumerate() {
            let mut filenames = self.class_images(class_name)?;
            if filenames.len() <= self.num_test_per_class {
                return Err(TrainingError::runtime(format!(
                    "class '{}' has {} images, not enough to hold out {} for the test split",
                    class_name,
                    filenames.len(),
                    self.num_test_per_class
                )));
            }
            filenames.shuffle(&mut rng);

            let (test, train) = filenames.split_at(self.num_test_per_class);
            for filename in test {
                test_rows.push(row(filename, label, class_name));
            }
            for filename in train {
                train_rows.push(row(filename, label, class_name));
            }

            let num_labeled = (train.len() as f64 * self.labeled_fraction).round() as usize;
            for filename in &train[..num_labeled] {
                labeled_rows.push(row(filename, label, class_name));
            }
        }

        fs::create_dir_all(&self.output_dir)?;
        write_manifest(&self.output_dir.join("stl.csv"), &train_rows)?;
        write_manifest(&self.output_dir.join("test.csv"), &test_rows)?;
        write_manifest(&self.output_dir.join("labeled.csv"), &labeled_rows)?;

        Ok(ManifestSummary {
            classes,
            train_rows: train_rows.len(),
            test_rows: test_rows.len(),
            labeled_rows: labeled_rows.len(),
        })
    }

    fn discover_classes(&self) -> Result<Vec<String>, TrainingError> {
        let mut classes = Vec::new();
        for entry in fs::read_dir(&self.images_root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();
        Ok(classes)
    }

    fn class_images(&self, class_name: &str) -> Result<Vec<String>, TrainingError> {
        let class_dir = self.images_root.join(class_name);
        let mut filenames = Vec::new();
        for entry in fs::read_dir(&class_dir)? {
            let entry = entry?;
            let path = entry.path();
            if is_image_file(&path) {
                filenames.push(format!(
                    "{}/{}",
                    class_name,
                    entry.file_name().to_string_lossy()
                ));
            }
        }
        filenames.sort();
        Ok(filenames)
    }
}

#[derive(Debug)]
pub struct ManifestSummary {
    pub classes: Vec<String>,
    pub train_rows: usize,
    pub test_rows: usize,
    pub labeled_rows: usize,
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.iter().any(|known| *known == ext)
        })
        .unwrap_or(false)
}

fn row(filename: &str, label: usize, class_name: &str) -> (String, usize, String) {
    (filename.to_string(), label, class_name.to_string())
}

fn write_manifest(
    path: &Path,
    rows: &[(String, usize, String)],
) -> Result<(), TrainingError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["Filename", "Label", "ClassName"])?;
    for (filename, label, class_name) in rows {
        writer.write_record([filename.as_str(), &label.to_string(), class_name.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}
