use std::path::PathBuf;

use clap::Parser;
use training::{data::preprocess::ManifestBuilder, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("manifest generation failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Builds CSV annotation manifests from a class-per-directory image tree", long_about = None)]
struct Args {
    #[arg(long, value_name = "PATH", help = "Directory holding one subdirectory per class")]
    images: PathBuf,

    #[arg(long, value_name = "PATH", help = "Directory the manifests are written to")]
    output: PathBuf,

    #[arg(long, default_value_t = 60, help = "Images held out per class for the test split")]
    num_test: usize,

    #[arg(
        long,
        default_value_t = 0.25,
        help = "Fraction of the training split sampled into the labeled subset"
    )]
    labeled_fraction: f64,

    #[arg(long, default_value_t = 0, help = "Shuffle seed")]
    seed: u64,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut builder = ManifestBuilder::new(args.images, args.output.clone());
    builder.num_test_per_class = args.num_test;
    builder.labeled_fraction = args.labeled_fraction;
    builder.seed = args.seed;

    let summary = builder.run()?;
    println!(
        "wrote manifests to {}: {} classes, {} train rows, {} test rows, {} labeled rows",
        args.output.display(),
        summary.classes.len(),
        summary.train_rows,
        summary.test_rows,
        summary.labeled_rows
    );
    Ok(())
}
