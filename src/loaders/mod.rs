//! Pretrained checkpoint loading
//!
//! Builds the frozen generative components from a diffusers-layout model
//! directory: text encoder + tokenizer, UNet weight map, and the noise
//! scheduler. Everything comes back cast to the working precision and
//! placed on the compute device.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use log::info;
use std::collections::HashMap;
use std::path::Path;

use crate::models::unet::{UNet, UNetConfig};
use crate::trainers::scheduler::{NoiseScheduler, PredictionType, SchedulerVariant};
use crate::trainers::text_encoder::PromptEncoder;

fn load_tensors(path: &Path, dtype: DType, device: &Device) -> Result<HashMap<String, Tensor>> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("loading {}", path.display()))?;
    tensors
        .into_iter()
        .map(|(k, v)| Ok((k, v.to_dtype(dtype)?)))
        .collect()
}

/// Load the embedding provider, denoiser and sampler for one training run.
pub fn load_models(
    model_dir: &Path,
    scheduler_name: &str,
    v2: bool,
    v_pred: bool,
    dtype: DType,
    device: &Device,
) -> Result<(PromptEncoder, UNet, NoiseScheduler)> {
    info!("Loading pretrained model from {}", model_dir.display());

    let text_encoder_weights = load_tensors(
        &model_dir.join("text_encoder").join("model.safetensors"),
        dtype,
        device,
    )?;
    let tokenizer_path = model_dir.join("tokenizer").join("tokenizer.json");
    let encoder = PromptEncoder::new(text_encoder_weights, &tokenizer_path, v2, dtype, device)?;

    let unet_weights = load_tensors(
        &model_dir
            .join("unet")
            .join("diffusion_pytorch_model.safetensors"),
        dtype,
        device,
    )?;
    info!("UNet weights: {} tensors", unet_weights.len());
    let config = if v2 { UNetConfig::v2() } else { UNetConfig::v1() };
    let unet = UNet::new(unet_weights, config);

    let prediction = if v_pred {
        PredictionType::VPrediction
    } else {
        PredictionType::Epsilon
    };
    let scheduler = NoiseScheduler::new(SchedulerVariant::from_name(scheduler_name), prediction);

    Ok((encoder, unet, scheduler))
}
