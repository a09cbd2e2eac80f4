//! UNet forward pass over a diffusers-format weight map
//!
//! The denoiser is computed functionally from loaded safetensors weights
//! rather than through a module tree. Every attention projection goes
//! through `LoraNetwork::apply`, which is where the adapters hook in.

use anyhow::{anyhow, Result};
use candle_core::{DType, Tensor, D};
use std::collections::HashMap;

use crate::core::DenoisingModel;
use crate::models::lora::LoraNetwork;

/// Width/layout constants for the SD UNet family.
#[derive(Debug, Clone)]
pub struct UNetConfig {
    pub model_channels: usize,
    pub channel_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub context_dim: usize,
    /// v2 checkpoints use fixed 64-wide heads, v1 uses 8 heads.
    pub head_dim: Option<usize>,
}

impl UNetConfig {
    pub fn v1() -> Self {
        Self {
            model_channels: 320,
            channel_mult: vec![1, 2, 4, 4],
            num_res_blocks: 2,
            context_dim: 768,
            head_dim: None,
        }
    }

    pub fn v2() -> Self {
        Self {
            context_dim: 1024,
            head_dim: Some(64),
            ..Self::v1()
        }
    }

    fn attention_heads(&self, channels: usize) -> (usize, usize) {
        match self.head_dim {
            Some(dim) => (channels / dim, dim),
            None => (8, channels / 8),
        }
    }
}

pub struct UNet {
    weights: HashMap<String, Tensor>,
    config: UNetConfig,
}

impl UNet {
    pub fn new(weights: HashMap<String, Tensor>, config: UNetConfig) -> Self {
        Self { weights, config }
    }

    pub fn weights(&self) -> &HashMap<String, Tensor> {
        &self.weights
    }

    fn w(&self, key: &str) -> Result<&Tensor> {
        self.weights
            .get(key)
            .ok_or_else(|| anyhow!("missing UNet weight: {key}"))
    }

    fn has(&self, key: &str) -> bool {
        self.weights.contains_key(key)
    }
}

impl DenoisingModel for UNet {
    fn predict(
        &self,
        latents: &Tensor,
        timestep: &Tensor,
        encoder_hidden_states: &Tensor,
        lora: &LoraNetwork,
    ) -> Result<Tensor> {
        forward_unet(latents, timestep, encoder_hidden_states, self, lora)
    }
}

/// Sinusoidal timestep embedding.
pub fn timestep_embedding(timesteps: &Tensor, dim: usize, max_period: f32) -> Result<Tensor> {
    let half_dim = dim / 2;
    let freqs = (0..half_dim)
        .map(|i| (-(i as f32) * (max_period.ln() / half_dim as f32)).exp())
        .collect::<Vec<_>>();

    let device = timesteps.device();
    let freqs_tensor = Tensor::from_vec(freqs, &[half_dim], device)?;

    let timesteps = timesteps.flatten_all()?.to_dtype(DType::F32)?;
    let args = timesteps
        .unsqueeze(1)?
        .broadcast_mul(&freqs_tensor.unsqueeze(0)?)?;

    Ok(Tensor::cat(&[args.cos()?, args.sin()?], 1)?)
}

fn resnet_block(unet: &UNet, x: &Tensor, time_emb: &Tensor, prefix: &str) -> Result<Tensor> {
    let h = group_norm(x, 32, unet.w(&format!("{prefix}.norm1.weight"))?,
                       unet.w(&format!("{prefix}.norm1.bias"))?)?;
    let h = h.silu()?;
    let h = conv2d(&h, unet.w(&format!("{prefix}.conv1.weight"))?,
                   unet.w(&format!("{prefix}.conv1.bias"))?, 1, 1)?;

    let time_proj = time_emb
        .silu()?
        .matmul(&unet.w(&format!("{prefix}.time_emb_proj.weight"))?.t()?)?
        .broadcast_add(unet.w(&format!("{prefix}.time_emb_proj.bias"))?)?
        .unsqueeze(2)?
        .unsqueeze(3)?;
    let h = h.broadcast_add(&time_proj)?;

    let h = group_norm(&h, 32, unet.w(&format!("{prefix}.norm2.weight"))?,
                       unet.w(&format!("{prefix}.norm2.bias"))?)?;
    let h = h.silu()?;
    let h = conv2d(&h, unet.w(&format!("{prefix}.conv2.weight"))?,
                   unet.w(&format!("{prefix}.conv2.bias"))?, 1, 1)?;

    // Channel changes carry a learned shortcut.
    let skip = if unet.has(&format!("{prefix}.conv_shortcut.weight")) {
        conv2d(x, unet.w(&format!("{prefix}.conv_shortcut.weight"))?,
               unet.w(&format!("{prefix}.conv_shortcut.bias"))?, 1, 0)?
    } else {
        x.clone()
    };

    Ok((h + skip)?)
}

fn attention(
    unet: &UNet,
    lora: &LoraNetwork,
    hidden_states: &Tensor,
    context: Option<&Tensor>,
    prefix: &str,
    heads: usize,
    dim_head: usize,
) -> Result<Tensor> {
    let (batch_size, sequence_length, channels) = hidden_states.dims3()?;
    let context = context.unwrap_or(hidden_states);
    let context_seq_len = context.dims()[1];

    let q = lora.apply(
        &format!("{prefix}.to_q"),
        hidden_states,
        unet.w(&format!("{prefix}.to_q.weight"))?,
        None,
    )?;
    let k = lora.apply(
        &format!("{prefix}.to_k"),
        context,
        unet.w(&format!("{prefix}.to_k.weight"))?,
        None,
    )?;
    let v = lora.apply(
        &format!("{prefix}.to_v"),
        context,
        unet.w(&format!("{prefix}.to_v.weight"))?,
        None,
    )?;

    let q = q.reshape((batch_size, sequence_length, heads, dim_head))?.transpose(1, 2)?;
    let k = k.reshape((batch_size, context_seq_len, heads, dim_head))?.transpose(1, 2)?;
    let v = v.reshape((batch_size, context_seq_len, heads, dim_head))?.transpose(1, 2)?;

    let scale = (dim_head as f64).sqrt();
    let scores = (q.contiguous()?.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? / scale)?;
    let attn_weights = candle_nn::ops::softmax_last_dim(&scores)?;
    let attn_output = attn_weights.matmul(&v.contiguous()?)?;

    let attn_output = attn_output
        .transpose(1, 2)?
        .reshape((batch_size, sequence_length, channels))?;

    lora.apply(
        &format!("{prefix}.to_out.0"),
        &attn_output,
        unet.w(&format!("{prefix}.to_out.0.weight"))?,
        unet.weights.get(&format!("{prefix}.to_out.0.bias")),
    )
}

fn feed_forward(unet: &UNet, x: &Tensor, prefix: &str) -> Result<Tensor> {
    let h = linear_3d(x, unet.w(&format!("{prefix}.net.0.proj.weight"))?,
                      Some(unet.w(&format!("{prefix}.net.0.proj.bias"))?))?;

    // GEGLU
    let chunks = h.chunk(2, D::Minus1)?;
    let h = (chunks[0].clone() * chunks[1].gelu()?)?;

    linear_3d(&h, unet.w(&format!("{prefix}.net.2.weight"))?,
              Some(unet.w(&format!("{prefix}.net.2.bias"))?))
}

/// Transformer2D block: group norm, projection in, self attention, cross
/// attention, feed forward, projection out, residual.
fn transformer_block(
    unet: &UNet,
    lora: &LoraNetwork,
    x: &Tensor,
    encoder_hidden_states: &Tensor,
    prefix: &str,
) -> Result<Tensor> {
    let (b, c, h_size, w_size) = x.dims4()?;
    let (heads, dim_head) = unet.config.attention_heads(c);

    let residual = x.clone();
    let h = group_norm(x, 32, unet.w(&format!("{prefix}.norm.weight"))?,
                       unet.w(&format!("{prefix}.norm.bias"))?)?;

    // v1 checkpoints use a 1x1 conv projection, v2 a linear one.
    let proj_in_key = format!("{prefix}.proj_in.weight");
    let proj_in_is_conv = unet.w(&proj_in_key)?.dims().len() == 4;
    let mut h = if proj_in_is_conv {
        let h = conv2d(&h, unet.w(&proj_in_key)?, unet.w(&format!("{prefix}.proj_in.bias"))?, 1, 0)?;
        h.permute((0, 2, 3, 1))?.reshape((b, h_size * w_size, c))?
    } else {
        let h = h.permute((0, 2, 3, 1))?.reshape((b, h_size * w_size, c))?;
        linear_3d(&h, unet.w(&proj_in_key)?, Some(unet.w(&format!("{prefix}.proj_in.bias"))?))?
    };

    let block = format!("{prefix}.transformer_blocks.0");

    let norm1 = layer_norm(&h, unet.w(&format!("{block}.norm1.weight"))?,
                           unet.w(&format!("{block}.norm1.bias"))?)?;
    h = (attention(unet, lora, &norm1, None, &format!("{block}.attn1"), heads, dim_head)? + h)?;

    let norm2 = layer_norm(&h, unet.w(&format!("{block}.norm2.weight"))?,
                           unet.w(&format!("{block}.norm2.bias"))?)?;
    h = (attention(unet, lora, &norm2, Some(encoder_hidden_states),
                   &format!("{block}.attn2"), heads, dim_head)? + h)?;

    let norm3 = layer_norm(&h, unet.w(&format!("{block}.norm3.weight"))?,
                           unet.w(&format!("{block}.norm3.bias"))?)?;
    h = (feed_forward(unet, &norm3, &format!("{block}.ff"))? + h)?;

    let proj_out_key = format!("{prefix}.proj_out.weight");
    let h = if proj_in_is_conv {
        let h = h.reshape((b, h_size, w_size, c))?.permute((0, 3, 1, 2))?.contiguous()?;
        conv2d(&h, unet.w(&proj_out_key)?, unet.w(&format!("{prefix}.proj_out.bias"))?, 1, 0)?
    } else {
        let h = linear_3d(&h, unet.w(&proj_out_key)?, Some(unet.w(&format!("{prefix}.proj_out.bias"))?))?;
        h.reshape((b, h_size, w_size, c))?.permute((0, 3, 1, 2))?.contiguous()?
    };

    Ok((h + residual)?)
}

/// Full UNet forward: conv in, down path with skips, middle, up path,
/// conv out. Attention placement follows whichever blocks carry attention
/// weights in the checkpoint.
pub fn forward_unet(
    sample: &Tensor,
    timestep: &Tensor,
    encoder_hidden_states: &Tensor,
    unet: &UNet,
    lora: &LoraNetwork,
) -> Result<Tensor> {
    let dtype = sample.dtype();
    let config = &unet.config;

    // Time embedding
    let t_emb = {
        let t = timestep_embedding(timestep, config.model_channels, 10000.0)?.to_dtype(dtype)?;
        let t = t
            .matmul(&unet.w("time_embedding.linear_1.weight")?.t()?)?
            .broadcast_add(unet.w("time_embedding.linear_1.bias")?)?
            .silu()?;
        t.matmul(&unet.w("time_embedding.linear_2.weight")?.t()?)?
            .broadcast_add(unet.w("time_embedding.linear_2.bias")?)?
    };

    let mut h = conv2d(sample, unet.w("conv_in.weight")?, unet.w("conv_in.bias")?, 1, 1)?;

    // Down path
    let mut skips = vec![h.clone()];
    let levels = config.channel_mult.len();

    for i in 0..levels {
        for j in 0..config.num_res_blocks {
            h = resnet_block(unet, &h, &t_emb, &format!("down_blocks.{i}.resnets.{j}"))?;

            let attn_prefix = format!("down_blocks.{i}.attentions.{j}");
            if unet.has(&format!("{attn_prefix}.norm.weight")) {
                h = transformer_block(unet, lora, &h, encoder_hidden_states, &attn_prefix)?;
            }
            skips.push(h.clone());
        }

        if i < levels - 1 {
            h = conv2d(&h, unet.w(&format!("down_blocks.{i}.downsamplers.0.conv.weight"))?,
                       unet.w(&format!("down_blocks.{i}.downsamplers.0.conv.bias"))?, 2, 1)?;
            skips.push(h.clone());
        }
    }

    // Middle
    h = resnet_block(unet, &h, &t_emb, "mid_block.resnets.0")?;
    h = transformer_block(unet, lora, &h, encoder_hidden_states, "mid_block.attentions.0")?;
    h = resnet_block(unet, &h, &t_emb, "mid_block.resnets.1")?;

    // Up path
    for i in 0..levels {
        for j in 0..config.num_res_blocks + 1 {
            let skip = skips
                .pop()
                .ok_or_else(|| anyhow!("missing skip connection at up_blocks.{i}.resnets.{j}"))?;
            h = Tensor::cat(&[&h, &skip], 1)?;
            h = resnet_block(unet, &h, &t_emb, &format!("up_blocks.{i}.resnets.{j}"))?;

            let attn_prefix = format!("up_blocks.{i}.attentions.{j}");
            if unet.has(&format!("{attn_prefix}.norm.weight")) {
                h = transformer_block(unet, lora, &h, encoder_hidden_states, &attn_prefix)?;
            }
        }

        if i < levels - 1 {
            h = h.upsample_nearest2d(h.dims()[2] * 2, h.dims()[3] * 2)?;
            h = conv2d(&h, unet.w(&format!("up_blocks.{i}.upsamplers.0.conv.weight"))?,
                       unet.w(&format!("up_blocks.{i}.upsamplers.0.conv.bias"))?, 1, 1)?;
        }
    }

    // Output layers
    let h = group_norm(&h, 32, unet.w("conv_norm_out.weight")?, unet.w("conv_norm_out.bias")?)?;
    let h = h.silu()?;
    conv2d(&h, unet.w("conv_out.weight")?, unet.w("conv_out.bias")?, 1, 1)
}

// Helper ops

fn conv2d(x: &Tensor, weight: &Tensor, bias: &Tensor, stride: usize, padding: usize) -> Result<Tensor> {
    let out = x.conv2d(weight, padding, stride, 1, 1)?;
    let bias = bias.reshape((1, bias.dims()[0], 1, 1))?;
    Ok(out.broadcast_add(&bias)?)
}

fn group_norm(x: &Tensor, groups: usize, scale: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let x = x.reshape((b, groups, c / groups, h, w))?;

    let mean = x.mean_keepdim(2)?.mean_keepdim(3)?.mean_keepdim(4)?;
    let x_centered = x.broadcast_sub(&mean)?;
    let var = x_centered.sqr()?.mean_keepdim(2)?.mean_keepdim(3)?.mean_keepdim(4)?;
    let x_norm = x_centered.broadcast_div(&(var + 1e-5)?.sqrt()?)?;

    let x_norm = x_norm.reshape((b, c, h, w))?;
    let scale = scale.reshape((1, c, 1, 1))?;
    let bias = bias.reshape((1, c, 1, 1))?;
    Ok(x_norm.broadcast_mul(&scale)?.broadcast_add(&bias)?)
}

fn layer_norm(x: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let norm = candle_nn::LayerNorm::new(weight.clone(), bias.clone(), 1e-5);
    Ok(candle_nn::Module::forward(&norm, x)?)
}

fn linear_3d(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let (b, s, d) = x.dims3()?;
    let out_d = weight.dims()[0];
    let mut out = x.reshape((b * s, d))?.matmul(&weight.t()?)?;
    if let Some(bias) = bias {
        out = out.broadcast_add(bias)?;
    }
    Ok(out.reshape((b, s, out_d))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn timestep_embedding_shape_and_range() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(vec![0i64, 500, 999], &[3], &device).unwrap();
        let emb = timestep_embedding(&t, 320, 10000.0).unwrap();
        assert_eq!(emb.dims(), &[3, 320]);

        let max = emb.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= 1.0 + 1e-6);
    }

    #[test]
    fn head_layout_differs_between_versions() {
        assert_eq!(UNetConfig::v1().attention_heads(320), (8, 40));
        assert_eq!(UNetConfig::v2().attention_heads(320), (5, 64));
    }
}
