//! Concept-erasure training loop
//!
//! Fine-tunes a low-rank adapter so the denoiser's prediction for a target
//! concept is steered away from (or toward) the concept direction, leaving
//! the base weights untouched. Per iteration: partially denoise a fresh
//! latent with the adapter enabled, take two reference predictions with it
//! disabled, one trainable prediction with it enabled, and regress the
//! enabled prediction onto the guidance-weighted target.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use log::{info, warn};
use rand::Rng;
use std::fs;
use std::path::PathBuf;

use crate::core::DenoisingModel;
use crate::loaders;
use crate::models::lora::{LoraNetwork, DEFAULT_TARGET_MODULES};
use crate::models::unet::UNet;
use crate::tracking::RunTracker;
use crate::trainers::scheduler::{rescale_timestep_index, NoiseScheduler, TRAIN_TIMESTEPS};
use crate::trainers::{concept_file_name, diffusion, resolve_dtype, TrainingConfig};

/// Coarse schedule length used to pick how far to denoise.
pub const DDIM_STEPS: usize = 50;
/// Guidance weight for the partial-denoise phase.
const PARTIAL_DENOISE_GUIDANCE: f64 = 3.0;

/// Uniform draw of the coarse denoising extent. Endpoints are excluded:
/// index 0 would mean no denoising at all, the last index near-terminal
/// denoising.
fn draw_coarse_index(rng: &mut impl Rng, coarse_steps: usize) -> usize {
    rng.gen_range(1..=coarse_steps - 2)
}

/// Outcome of a training run. A non-zero `non_finite_steps` means the loss
/// went NaN/inf on some iterations and those updates were skipped.
#[derive(Debug, Default)]
pub struct TrainReport {
    pub iterations_run: usize,
    pub non_finite_steps: usize,
    pub final_loss: Option<f32>,
}

pub struct ConceptTrainer<M: DenoisingModel> {
    pub model: M,
    pub scheduler: NoiseScheduler,
    pub network: LoraNetwork,
    optimizer: AdamW,
    target_embeddings: Tensor,
    neutral_embeddings: Tensor,
    pub config: TrainingConfig,
    device: Device,
    dtype: DType,
}

impl ConceptTrainer<UNet> {
    /// Load the frozen components, bind the adapter, and cache the two
    /// conditioning embeddings. The text encoder is released as soon as
    /// the embeddings exist.
    pub fn new(config: TrainingConfig) -> Result<Self> {
        let device = Device::cuda_if_available(0)?;
        let dtype = resolve_dtype(&config.precision);
        info!("Device: {:?}, precision: {:?}", device, dtype);

        let (encoder, unet, scheduler) = loaders::load_models(
            &config.pretrained_model,
            &config.scheduler_name,
            config.v2,
            config.v_pred,
            dtype,
            &device,
        )?;

        let network = LoraNetwork::attach(
            config.rank,
            config.alpha,
            unet.weights(),
            DEFAULT_TARGET_MODULES,
            &device,
            dtype,
        )?;
        info!("Trainable parameters: {}", network.num_trainable_params());

        let neutral_embeddings = encoder
            .encode_pair(&config.neutral_prompt)?
            .to_dtype(dtype)?
            .detach();
        let target_embeddings = encoder
            .encode_pair(&config.prompt)?
            .to_dtype(dtype)?
            .detach();

        // The encoder and tokenizer are not needed again; reclaim their
        // memory before the loop starts.
        drop(encoder);
        info!("Cached conditioning embeddings, released text encoder");

        Self::from_parts(
            unet,
            scheduler,
            network,
            target_embeddings,
            neutral_embeddings,
            config,
            device,
            dtype,
        )
    }
}

impl<M: DenoisingModel> ConceptTrainer<M> {
    /// Assemble a trainer from already-built components. Registers only
    /// the adapter's parameters with the optimizer.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        model: M,
        scheduler: NoiseScheduler,
        network: LoraNetwork,
        target_embeddings: Tensor,
        neutral_embeddings: Tensor,
        config: TrainingConfig,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        let optimizer = AdamW::new(
            network.vars(),
            ParamsAdamW {
                lr: config.lr,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            scheduler,
            network,
            optimizer,
            target_embeddings,
            neutral_embeddings,
            config,
            device,
            dtype,
        })
    }

    /// Run the training loop and persist the adapter weights.
    pub fn train(&mut self, tracker: &mut RunTracker) -> Result<TrainReport> {
        info!("=== Starting Training ===");
        info!("Prompt: '{}'", self.config.prompt);
        info!("Iterations: {}", self.config.iterations);
        info!("Guidance: {}", self.config.negative_guidance);
        info!("Learning rate: {}", self.config.lr);

        tracker.log_config(&self.config)?;

        #[cfg(feature = "progress-bar")]
        let pbar = {
            let pbar = indicatif::ProgressBar::new(self.config.iterations as u64);
            pbar.set_style(
                indicatif::ProgressStyle::with_template(
                    "{bar:40} {pos}/{len} {msg}",
                )
                .context("progress bar template")?,
            );
            pbar
        };

        let mut report = TrainReport::default();
        let mut rng = rand::thread_rng();

        for step in 0..self.config.iterations {
            // Coarse regime controls how far the latent is denoised.
            self.scheduler.set_timesteps(DDIM_STEPS);

            let timesteps_to = draw_coarse_index(&mut rng, DDIM_STEPS);

            let latents = self.scheduler.initial_latents(
                1,
                self.config.resolution,
                &self.device,
                self.dtype,
            )?;

            // Partial denoising happens through the adapter-enabled path;
            // its effect on intermediate state is part of the signal.
            let denoised_latents = {
                let _scope = self.network.activate()?;
                diffusion::denoise(
                    &self.model,
                    &mut self.scheduler,
                    &self.network,
                    &latents,
                    &self.target_embeddings,
                    0,
                    timesteps_to,
                    PARTIAL_DENOISE_GUIDANCE,
                )?
            }
            .detach();

            // Fine regime queries noise at the same physical timestep.
            self.scheduler.set_timesteps(TRAIN_TIMESTEPS);
            let fine_index = rescale_timestep_index(timesteps_to, DDIM_STEPS, TRAIN_TIMESTEPS);
            let current_timestep = self.scheduler.timesteps()[fine_index];

            // Reference predictions, adapter DISABLED, moved to host
            // memory in full precision.
            let positive_latents = diffusion::predict_noise(
                &self.model,
                &self.scheduler,
                &self.network,
                current_timestep,
                &denoised_latents,
                &self.target_embeddings,
                1.0,
            )?
            .detach()
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;

            let neutral_latents = diffusion::predict_noise(
                &self.model,
                &self.scheduler,
                &self.network,
                current_timestep,
                &denoised_latents,
                &self.neutral_embeddings,
                1.0,
            )?
            .detach()
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;

            // Trainable prediction, adapter ENABLED. Same latent, same
            // timestep; the only difference is the adapter.
            let negative_latents = {
                let _scope = self.network.activate()?;
                diffusion::predict_noise(
                    &self.model,
                    &self.scheduler,
                    &self.network,
                    current_timestep,
                    &denoised_latents,
                    &self.target_embeddings,
                    1.0,
                )?
            }
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;

            // Guidance target: push away from the concept direction.
            let guidance_target = (&neutral_latents
                - ((positive_latents - &neutral_latents)? * self.config.negative_guidance)?)?
                .detach();

            let loss = candle_nn::loss::mse(&negative_latents, &guidance_target)?;
            let loss_value = loss.to_scalar::<f32>()?;

            report.iterations_run = step + 1;
            tracker.log_scalar(step, "loss", loss_value as f64)?;

            if !loss_value.is_finite() {
                warn!("Non-finite loss at step {}, skipping update", step);
                report.non_finite_steps += 1;
                #[cfg(feature = "progress-bar")]
                pbar.inc(1);
                continue;
            }

            let grads = loss.backward()?;
            self.optimizer.step(&grads)?;
            report.final_loss = Some(loss_value);

            if step % 10 == 0 {
                info!(
                    "Step {}/{}: loss = {:.6}",
                    step, self.config.iterations, loss_value
                );
            }
            #[cfg(feature = "progress-bar")]
            {
                pbar.set_message(format!("loss: {loss_value:.6}"));
                pbar.inc(1);
            }
        }

        #[cfg(feature = "progress-bar")]
        pbar.finish();

        let path = self.save_weights()?;
        info!("Saved adapter weights to {}", path.display());
        tracker.flush()?;

        if report.non_finite_steps > 0 {
            warn!(
                "{} of {} iterations had non-finite loss",
                report.non_finite_steps, self.config.iterations
            );
        }
        Ok(report)
    }

    /// Serialize the adapter parameters (only) in the working precision.
    pub fn save_weights(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.save_path).with_context(|| {
            format!("creating output directory {}", self.config.save_path.display())
        })?;
        let path = self
            .config
            .save_path
            .join(concept_file_name(&self.config.prompt));
        self.network.save(&path, self.dtype)?;
        Ok(path)
    }
}
