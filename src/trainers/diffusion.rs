//! Noise prediction and partial denoising
//!
//! Thin driving layer between the orchestrator and the denoiser: one
//! classifier-free-guided forward pass, and a ranged denoising loop over
//! the current schedule.

use anyhow::Result;
use candle_core::Tensor;

use crate::core::DenoisingModel;
use crate::models::lora::LoraNetwork;
use crate::trainers::scheduler::NoiseScheduler;

/// Single guided noise prediction at one timestep. `text_embeddings` packs
/// the unconditional and conditional rows as `[2, seq, dim]`; the latent is
/// duplicated to match and the two predictions are recombined with the
/// guidance weight.
pub fn predict_noise(
    model: &dyn DenoisingModel,
    scheduler: &NoiseScheduler,
    lora: &LoraNetwork,
    timestep: usize,
    latents: &Tensor,
    text_embeddings: &Tensor,
    guidance_scale: f64,
) -> Result<Tensor> {
    let batch_size = latents.dims()[0];

    let latent_model_input = Tensor::cat(&[latents, latents], 0)?;
    let latent_model_input = scheduler.scale_model_input(&latent_model_input, timestep)?;

    let t = Tensor::from_vec(
        vec![timestep as i64; batch_size * 2],
        &[batch_size * 2],
        latents.device(),
    )?;

    let noise_pred = model.predict(&latent_model_input, &t, text_embeddings, lora)?;

    let noise_pred_uncond = noise_pred.narrow(0, 0, batch_size)?;
    let noise_pred_cond = noise_pred.narrow(0, batch_size, batch_size)?;

    let diff = (noise_pred_cond - &noise_pred_uncond)?;
    Ok((noise_pred_uncond + (diff * guidance_scale)?)?)
}

/// Run the sampler over `[start_step, end_step)` of the current schedule,
/// returning the partially denoised latent. Intermediate latents are
/// detached each step; this loop prepares state, it is not the trainable
/// signal.
#[allow(clippy::too_many_arguments)]
pub fn denoise(
    model: &dyn DenoisingModel,
    scheduler: &mut NoiseScheduler,
    lora: &LoraNetwork,
    latents: &Tensor,
    text_embeddings: &Tensor,
    start_step: usize,
    end_step: usize,
    guidance_scale: f64,
) -> Result<Tensor> {
    let timesteps: Vec<usize> = scheduler.timesteps()[start_step..end_step].to_vec();

    let mut latents = latents.clone();
    for timestep in timesteps {
        let noise_pred = predict_noise(
            model,
            scheduler,
            lora,
            timestep,
            &latents,
            text_embeddings,
            guidance_scale,
        )?;
        latents = scheduler.step(&noise_pred, timestep, &latents)?.detach();
    }
    Ok(latents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::scheduler::{PredictionType, SchedulerVariant};
    use candle_core::{DType, Device};

    /// Denoiser that always predicts zero noise; enough to exercise the
    /// guidance plumbing.
    struct ZeroDenoiser;

    impl DenoisingModel for ZeroDenoiser {
        fn predict(
            &self,
            latents: &Tensor,
            _timestep: &Tensor,
            _encoder_hidden_states: &Tensor,
            _lora: &LoraNetwork,
        ) -> Result<Tensor> {
            Ok(latents.zeros_like()?)
        }
    }

    #[test]
    fn guided_prediction_keeps_batch_shape() {
        let device = Device::Cpu;
        let scheduler = NoiseScheduler::new(SchedulerVariant::Ddim, PredictionType::Epsilon);
        let lora = LoraNetwork::new(4, 1.0, DType::F32);
        let latents = Tensor::randn(0.0f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        let embeddings = Tensor::zeros((2, 77, 8), DType::F32, &device).unwrap();

        let pred = predict_noise(
            &ZeroDenoiser,
            &scheduler,
            &lora,
            999,
            &latents,
            &embeddings,
            3.0,
        )
        .unwrap();
        assert_eq!(pred.dims(), &[1, 4, 8, 8]);
    }

    #[test]
    fn denoise_runs_requested_range() {
        let device = Device::Cpu;
        let mut scheduler = NoiseScheduler::new(SchedulerVariant::Ddim, PredictionType::Epsilon);
        scheduler.set_timesteps(50);
        let lora = LoraNetwork::new(4, 1.0, DType::F32);
        let latents = scheduler.initial_latents(1, 64, &device, DType::F32).unwrap();
        let embeddings = Tensor::zeros((2, 77, 8), DType::F32, &device).unwrap();

        let out = denoise(
            &ZeroDenoiser,
            &mut scheduler,
            &lora,
            &latents,
            &embeddings,
            0,
            10,
            3.0,
        )
        .unwrap();
        assert_eq!(out.dims(), latents.dims());
    }
}
