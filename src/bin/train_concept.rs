//! Concept erasure training CLI.
//!
//! Trains a low-rank adapter that suppresses (or, with negative guidance
//! below zero, amplifies) a text concept in a pretrained diffusion model.

use anyhow::Result;
use clap::Parser;
use concept_eraser::tracking::RunTracker;
use concept_eraser::trainers::concept_trainer::ConceptTrainer;
use concept_eraser::TrainingConfig;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a concept-erasure LoRA adapter")]
struct Args {
    /// Concept to erase, e.g. "van gogh style"
    #[arg(long)]
    prompt: String,

    /// Prompt the erased concept is steered toward (empty = unconditional)
    #[arg(long, default_value = "")]
    neutral_prompt: String,

    /// Path to a diffusers-layout pretrained model directory
    #[arg(long)]
    pretrained_model: PathBuf,

    /// LoRA rank
    #[arg(long, default_value_t = 4)]
    rank: usize,

    /// LoRA alpha
    #[arg(long, default_value_t = 1.0)]
    alpha: f32,

    /// Number of training iterations
    #[arg(long, default_value_t = 1000)]
    iterations: usize,

    /// Erasure strength; negative values emphasize the concept instead
    #[arg(long, default_value_t = 1.0)]
    negative_guidance: f64,

    /// Learning rate
    #[arg(long, default_value_t = 1e-5)]
    lr: f64,

    /// Directory the adapter weights are written to
    #[arg(long, default_value = "./output")]
    save_path: PathBuf,

    /// Load the checkpoint as Stable Diffusion v2.x
    #[arg(long)]
    v2: bool,

    /// The checkpoint uses v-prediction parameterization
    #[arg(long)]
    v_pred: bool,

    /// Working precision: float32, float16 or bfloat16
    #[arg(long, default_value = "float16")]
    precision: String,

    /// Scheduler: lms, ddim, ddpm or euler_a
    #[arg(long, default_value = "lms")]
    scheduler_name: String,

    /// Training resolution in pixels
    #[arg(long, default_value_t = 512)]
    resolution: usize,

    /// Write a JSONL metrics log next to the adapter weights
    #[arg(long)]
    track: bool,
}

impl Args {
    fn into_config(self) -> TrainingConfig {
        TrainingConfig {
            prompt: self.prompt,
            neutral_prompt: self.neutral_prompt,
            pretrained_model: self.pretrained_model,
            rank: self.rank,
            alpha: self.alpha,
            iterations: self.iterations,
            negative_guidance: self.negative_guidance,
            lr: self.lr,
            save_path: self.save_path,
            v2: self.v2,
            v_pred: self.v_pred,
            precision: self.precision,
            scheduler_name: self.scheduler_name,
            resolution: self.resolution,
            track: self.track,
        }
    }
}

fn main() -> Result<()> {
    concept_eraser::logging::init_logger();

    let config = Args::parse().into_config();

    info!("=== Concept Erasure Training ===");
    info!("Concept: '{}'", config.prompt);
    info!("Model: {}", config.pretrained_model.display());

    let mut tracker = if config.track {
        RunTracker::to_file(&config.save_path.join("metrics.jsonl"))?
    } else {
        RunTracker::disabled()
    };

    let mut trainer = ConceptTrainer::new(config)?;
    let report = trainer.train(&mut tracker)?;

    info!(
        "Done: {} iterations, final loss {:?}, {} non-finite steps",
        report.iterations_run, report.final_loss, report.non_finite_steps
    );
    Ok(())
}
