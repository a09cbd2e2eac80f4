//! CLIP prompt encoding
//!
//! Produces the fixed conditioning embeddings the training loop caches up
//! front. The encoder is dropped right after, so nothing here is kept
//! alive during iterations.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip;
use tokenizers::Tokenizer;

const MAX_TOKENS: usize = 77;
const EOS_TOKEN: u32 = 49407;

pub struct PromptEncoder {
    model: clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    device: Device,
}

impl PromptEncoder {
    pub fn new(
        weights: std::collections::HashMap<String, Tensor>,
        tokenizer_path: &std::path::Path,
        v2: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(weights, dtype, device);
        let config = if v2 {
            clip::Config::v2_1()
        } else {
            clip::Config::v1_5()
        };
        let model = clip::ClipTextTransformer::new(vb, &config)?;

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer: {e}"))?;

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    fn tokenize(&self, text: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("tokenization failed: {e}"))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(MAX_TOKENS);
        ids.resize(MAX_TOKENS, EOS_TOKEN);
        Ok(Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    /// Hidden states for one prompt: `[1, 77, dim]`.
    pub fn encode(&self, text: &str) -> Result<Tensor> {
        let tokens = self.tokenize(text)?;
        Ok(self.model.forward(&tokens)?)
    }

    /// Unconditional and conditional rows stacked as `[2, 77, dim]`, the
    /// layout classifier-free guidance expects.
    pub fn encode_pair(&self, prompt: &str) -> Result<Tensor> {
        let uncond = self.encode("")?;
        let cond = self.encode(prompt)?;
        Ok(Tensor::cat(&[uncond, cond], 0)?)
    }
}
