//! Generate image embeddings for a Cell Maps image crate
//!
//! Usage:
//!   cellmaps_image_embedding ./embedding --inputdir ./images
//!   cellmaps_image_embedding ./embedding --inputdir ./images --fake_embedder -vvv
//!   cellmaps_image_embedding ./embedding --inputdir ./images \
//!       --model_path https://example.org/models/densenet.pth --config inference.yaml

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use cellmaps_image_embedding::generator::synthetic::{DEFAULT_DIMENSIONS, SYNTHETIC_DISCLAIMER};
use cellmaps_image_embedding::logging::{setup_cmd_logging, verbosity_level};
use cellmaps_image_embedding::{
    DensenetLoader, EmbeddingGenerator, EmbeddingPipelineRunner, FallbackIdentity,
    ModelEmbeddingGenerator, ModelGeneratorConfig, SyntheticEmbeddingGenerator,
    DEFAULT_MODEL_PATH,
};

#[derive(Parser, Serialize)]
#[command(name = "cellmaps_image_embedding")]
#[command(version)]
#[command(about = "Generate per-gene image embeddings and compartment probabilities")]
struct Args {
    /// Output directory; must not exist
    outdir: PathBuf,

    /// Directory of channel images and the image gene node attributes table
    #[arg(long)]
    inputdir: PathBuf,

    /// Model weights: local path or http(s) URL
    #[arg(long = "model_path", default_value = DEFAULT_MODEL_PATH)]
    model_path: String,

    /// YAML file with inference settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Image gene node attributes fold
    #[arg(long)]
    fold: Option<u32>,

    /// Channel image file suffix
    #[arg(long)]
    suffix: Option<String>,

    /// Embedding width for --fake_embedder
    #[arg(long, default_value_t = DEFAULT_DIMENSIONS)]
    dimensions: usize,

    /// Emit random embeddings instead of running the model
    #[arg(long = "fake_embedder")]
    fake_embedder: bool,

    /// Seed for --fake_embedder
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    name: Option<String>,

    #[arg(long = "organization_name")]
    organization_name: Option<String>,

    #[arg(long = "project_name")]
    project_name: Option<String>,

    /// JSON file with name, organization-name and project-name, used when
    /// the input directory carries no RO-Crate
    #[arg(long)]
    provenance: Option<PathBuf>,

    /// Do not write output.log and error.log into the output directory
    #[arg(long = "skip_logging")]
    skip_logging: bool,

    /// Increase console verbosity (-v ERROR ... -vvvvv TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ProvenanceDefaults {
    name: Option<String>,
    organization_name: Option<String>,
    project_name: Option<String>,
}

impl From<ProvenanceDefaults> for FallbackIdentity {
    fn from(defaults: ProvenanceDefaults) -> Self {
        FallbackIdentity {
            name: defaults.name,
            organization_name: defaults.organization_name,
            project_name: defaults.project_name,
        }
    }
}

fn load_config(args: &Args) -> Result<ModelGeneratorConfig> {
    let mut config = match &args.config {
        Some(path) => ModelGeneratorConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ModelGeneratorConfig::default(),
    };
    if let Some(fold) = args.fold {
        config.fold = fold;
    }
    if let Some(suffix) = &args.suffix {
        config.suffix = suffix.clone();
    }
    Ok(config)
}

fn build_generator(args: &Args, config: ModelGeneratorConfig) -> Result<Box<dyn EmbeddingGenerator>> {
    if args.fake_embedder {
        // Shown whatever the -v level
        eprintln!("WARNING: {}", SYNTHETIC_DISCLAIMER);
        let mut generator = SyntheticEmbeddingGenerator::with_options(
            &args.inputdir,
            args.dimensions,
            config.fold,
            &config.suffix,
        )?;
        if let Some(seed) = args.seed {
            generator = generator.with_seed(seed);
        }
        return Ok(Box::new(generator));
    }
    let generator = ModelEmbeddingGenerator::new(
        &args.inputdir,
        &args.outdir,
        &args.model_path,
        config,
        Box::new(DensenetLoader),
    )?;
    Ok(Box::new(generator))
}

fn run(args: Args) -> Result<i32> {
    let config = load_config(&args)?;
    let fallback = match &args.provenance {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let defaults: ProvenanceDefaults = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            Some(FallbackIdentity::from(defaults))
        }
        None => None,
    };
    let generator = build_generator(&args, config)?;

    let mut builder = EmbeddingPipelineRunner::builder()
        .outdir(&args.outdir)
        .inputdir(&args.inputdir)
        .generator(generator)
        .input_data(serde_json::to_value(&args)?)
        .skip_logging(args.skip_logging)
        .console_level(verbosity_level(args.verbose));
    if let Some(fallback) = fallback {
        builder = builder.fallback_identity(fallback);
    }
    if let Some(name) = args.name.clone() {
        builder = builder.name(name);
    }
    if let Some(org) = args.organization_name.clone() {
        builder = builder.organization_name(org);
    }
    if let Some(project) = args.project_name.clone() {
        builder = builder.project_name(project);
    }

    let mut runner = builder.build()?;
    Ok(runner.run()?)
}

fn main() -> ExitCode {
    let args = Args::parse();
    setup_cmd_logging(args.verbose);

    match run(args) {
        Ok(status) => ExitCode::from(u8::try_from(status).unwrap_or(1)),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}
