//! Low-rank adapter network with scoped activation
//!
//! Adapters are plain `Var` pairs applied on top of frozen base weights.
//! The whole network is toggled through an RAII scope so predictions outside
//! the scope always see the unmodified model, even if a scope body panics.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use log::info;
use safetensors::{serialize, tensor::TensorView, Dtype as SafeDtype};
use std::cell::Cell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Attention projections that receive adapters, matching the diffusers
/// cross-attention module layout.
pub const DEFAULT_TARGET_PROJECTIONS: &[&str] = &["to_q", "to_k", "to_v", "to_out.0"];

/// Attention blocks the adapters bind to.
pub const DEFAULT_TARGET_MODULES: &[&str] = &["attn1", "attn2"];

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("adapter activation scope is already open")]
    AlreadyActive,
}

/// One low-rank weight delta: up(down(x)) * scale.
pub struct LoraAdapter {
    pub down: Var,
    pub up: Var,
    pub scale: f64,
}

impl LoraAdapter {
    pub fn new(
        in_features: usize,
        out_features: usize,
        rank: usize,
        alpha: f32,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        // Down gets a small random init, up starts at zero so a fresh
        // adapter is an exact no-op.
        let down_tensor = Tensor::randn(0.0f32, 0.02, (rank, in_features), device)?.to_dtype(dtype)?;
        let up_tensor = Tensor::zeros((out_features, rank), dtype, device)?;

        Ok(Self {
            down: Var::from_tensor(&down_tensor)?,
            up: Var::from_tensor(&up_tensor)?,
            scale: (alpha / rank as f32) as f64,
        })
    }

    /// Delta for a 2D input batch: x @ down^T @ up^T * (scale * multiplier).
    fn delta(&self, input_2d: &Tensor, multiplier: f64) -> Result<Tensor> {
        let down_out = input_2d.matmul(&self.down.as_tensor().t()?)?;
        let up_out = down_out.matmul(&self.up.as_tensor().t()?)?;
        Ok((up_out * (self.scale * multiplier))?)
    }
}

/// Collection of adapters bound to a denoiser's target modules.
///
/// DISABLED is the resting state: `apply` reduces to the base linear op and
/// builds no adapter graph edges. `activate` flips to ENABLED for the
/// lifetime of the returned scope guard.
pub struct LoraNetwork {
    adapters: HashMap<String, LoraAdapter>,
    pub rank: usize,
    pub alpha: f32,
    pub dtype: DType,
    multiplier: Cell<f64>,
    active: Cell<bool>,
}

/// RAII guard for the ENABLED state. Dropping it (normally or during
/// unwinding) restores DISABLED.
pub struct ActivationScope<'a> {
    network: &'a LoraNetwork,
}

impl Drop for ActivationScope<'_> {
    fn drop(&mut self) {
        self.network.multiplier.set(0.0);
        self.network.active.set(false);
    }
}

impl LoraNetwork {
    pub fn new(rank: usize, alpha: f32, dtype: DType) -> Self {
        Self {
            adapters: HashMap::new(),
            rank,
            alpha,
            dtype,
            multiplier: Cell::new(0.0),
            active: Cell::new(false),
        }
    }

    /// Bind adapters to every target projection found in a denoiser weight
    /// map. Adapter shapes are read off the base weights.
    pub fn attach(
        rank: usize,
        alpha: f32,
        weights: &HashMap<String, Tensor>,
        target_modules: &[&str],
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let mut network = Self::new(rank, alpha, dtype);

        let mut names: Vec<&String> = weights
            .keys()
            .filter(|k| {
                k.ends_with(".weight")
                    && target_modules.iter().any(|m| k.contains(m))
                    && DEFAULT_TARGET_PROJECTIONS
                        .iter()
                        .any(|p| k.ends_with(&format!("{p}.weight")))
            })
            .collect();
        names.sort();

        for key in names {
            let module_name = key.trim_end_matches(".weight").to_string();
            let (out_features, in_features) = weights[key].dims2()?;
            network.adapters.insert(
                module_name,
                LoraAdapter::new(in_features, out_features, rank, alpha, device, dtype)?,
            );
        }

        if network.adapters.is_empty() {
            return Err(anyhow!("no target modules matched {:?}", target_modules));
        }
        info!(
            "Bound {} LoRA adapters (rank {}, alpha {})",
            network.adapters.len(),
            rank,
            alpha
        );
        Ok(network)
    }

    /// Enter the ENABLED state. Only one scope may be open at a time.
    pub fn activate(&self) -> Result<ActivationScope<'_>, ActivationError> {
        if self.active.get() {
            return Err(ActivationError::AlreadyActive);
        }
        self.active.set(true);
        self.multiplier.set(1.0);
        Ok(ActivationScope { network: self })
    }

    pub fn is_enabled(&self) -> bool {
        self.multiplier.get() != 0.0
    }

    /// Linear op with the adapter delta added when ENABLED. Handles the 3D
    /// `[batch, seq, dim]` inputs attention layers produce.
    pub fn apply(
        &self,
        module_name: &str,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (input_2d, folded) = if input.dims().len() == 3 {
            let (b, s, d) = input.dims3()?;
            (input.reshape((b * s, d))?, Some((b, s)))
        } else {
            (input.clone(), None)
        };

        let mut output = input_2d.matmul(&weight.t()?)?;

        let multiplier = self.multiplier.get();
        if multiplier != 0.0 {
            if let Some(adapter) = self.adapters.get(module_name) {
                output = (output + adapter.delta(&input_2d, multiplier)?)?;
            }
        }

        if let Some(bias) = bias {
            output = output.broadcast_add(bias)?;
        }

        if let Some((b, s)) = folded {
            let out_dim = weight.dims()[0];
            output = output.reshape((b, s, out_dim))?;
        }
        Ok(output)
    }

    /// Trainable parameters, for the optimizer. Nothing else in the model
    /// carries gradients.
    pub fn vars(&self) -> Vec<Var> {
        let mut names: Vec<&String> = self.adapters.keys().collect();
        names.sort();
        let mut vars = Vec::with_capacity(names.len() * 2);
        for name in names {
            let adapter = &self.adapters[name];
            vars.push(adapter.down.clone());
            vars.push(adapter.up.clone());
        }
        vars
    }

    pub fn num_adapters(&self) -> usize {
        self.adapters.len()
    }

    pub fn num_trainable_params(&self) -> usize {
        self.adapters
            .values()
            .map(|a| {
                a.down.dims().iter().product::<usize>() + a.up.dims().iter().product::<usize>()
            })
            .sum()
    }

    /// Serialize all adapter weights to one safetensors file in the given
    /// precision, with the usual ss_network_* metadata.
    pub fn save(&self, path: &Path, dtype: DType) -> Result<()> {
        let mut tensor_data = Vec::new();
        let mut tensor_info = Vec::new();

        let mut names: Vec<&String> = self.adapters.keys().collect();
        names.sort();

        for name in names {
            let adapter = &self.adapters[name];
            let key_base = name.replace('.', "_");

            for (suffix, var) in [("lora_down", &adapter.down), ("lora_up", &adapter.up)] {
                let tensor = var.as_tensor().to_dtype(dtype)?;
                tensor_info.push((
                    format!("lora_unet_{key_base}.{suffix}.weight"),
                    convert_dtype(dtype)?,
                    tensor.dims().to_vec(),
                    tensor_data.len(),
                ));
                tensor_data.push(tensor_to_bytes(&tensor)?);
            }
        }

        let mut tensors = HashMap::new();
        for (name, dtype, shape, idx) in tensor_info {
            tensors.insert(name, TensorView::new(dtype, shape, &tensor_data[idx])?);
        }

        let mut metadata = HashMap::new();
        metadata.insert("ss_network_rank".to_string(), self.rank.to_string());
        metadata.insert("ss_network_alpha".to_string(), self.alpha.to_string());
        metadata.insert("ss_network_module".to_string(), "networks.lora".to_string());

        let data = serialize(&tensors, &Some(metadata))?;
        fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Restore adapter weights from a file written by `save` into a network
    /// already bound to the same denoiser.
    pub fn load_weights(&self, path: &Path, device: &Device) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("reading {}", path.display()))?;

        for (name, adapter) in &self.adapters {
            let key_base = name.replace('.', "_");
            for (suffix, var) in [("lora_down", &adapter.down), ("lora_up", &adapter.up)] {
                let key = format!("lora_unet_{key_base}.{suffix}.weight");
                let tensor = tensors
                    .get(&key)
                    .ok_or_else(|| anyhow!("missing tensor {key}"))?;
                var.set(&tensor.to_dtype(self.dtype)?)?;
            }
        }
        Ok(())
    }
}

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        other => Err(anyhow!("unsupported save dtype {other:?}")),
    }
}

fn tensor_to_bytes(tensor: &Tensor) -> Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    let bytes = match tensor.dtype() {
        DType::F32 => bytemuck::cast_slice(&flat.to_vec1::<f32>()?).to_vec(),
        DType::F16 => bytemuck::cast_slice(&flat.to_vec1::<half::f16>()?).to_vec(),
        DType::BF16 => bytemuck::cast_slice(&flat.to_vec1::<half::bf16>()?).to_vec(),
        other => return Err(anyhow!("unsupported save dtype {other:?}")),
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn test_weights(device: &Device) -> HashMap<String, Tensor> {
        let mut weights = HashMap::new();
        for proj in ["to_q", "to_k", "to_v", "to_out.0"] {
            weights.insert(
                format!("down_blocks.0.attn1.{proj}.weight"),
                Tensor::randn(0.0f32, 1.0, (8, 8), device).unwrap(),
            );
        }
        weights
    }

    #[test]
    fn attach_binds_target_projections() {
        let device = Device::Cpu;
        let weights = test_weights(&device);
        let network =
            LoraNetwork::attach(2, 1.0, &weights, DEFAULT_TARGET_MODULES, &device, DType::F32)
                .unwrap();
        assert_eq!(network.num_adapters(), 4);
        assert_eq!(network.vars().len(), 8);
    }

    #[test]
    fn disabled_network_matches_base_linear() {
        let device = Device::Cpu;
        let weights = test_weights(&device);
        let network =
            LoraNetwork::attach(2, 1.0, &weights, DEFAULT_TARGET_MODULES, &device, DType::F32)
                .unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (3, 8), &device).unwrap();
        let key = "down_blocks.0.attn1.to_q";
        let weight = &weights[&format!("{key}.weight")];

        let base = input.matmul(&weight.t().unwrap()).unwrap();
        let through = network.apply(key, &input, weight, None).unwrap();

        let diff = (base - through)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn scope_restores_disabled_on_drop() {
        let device = Device::Cpu;
        let weights = test_weights(&device);
        let network =
            LoraNetwork::attach(2, 1.0, &weights, DEFAULT_TARGET_MODULES, &device, DType::F32)
                .unwrap();

        assert!(!network.is_enabled());
        {
            let _scope = network.activate().unwrap();
            assert!(network.is_enabled());
        }
        assert!(!network.is_enabled());
    }

    #[test]
    fn scope_restores_disabled_on_panic() {
        let device = Device::Cpu;
        let weights = test_weights(&device);
        let network =
            LoraNetwork::attach(2, 1.0, &weights, DEFAULT_TARGET_MODULES, &device, DType::F32)
                .unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _scope = network.activate().unwrap();
            panic!("mid-scope failure");
        }));
        assert!(result.is_err());
        assert!(!network.is_enabled());
        // A fresh scope can be opened afterwards.
        assert!(network.activate().is_ok());
    }

    #[test]
    fn nested_activation_is_rejected() {
        let device = Device::Cpu;
        let weights = test_weights(&device);
        let network =
            LoraNetwork::attach(2, 1.0, &weights, DEFAULT_TARGET_MODULES, &device, DType::F32)
                .unwrap();

        let _scope = network.activate().unwrap();
        assert!(matches!(
            network.activate(),
            Err(ActivationError::AlreadyActive)
        ));
    }

    #[test]
    fn save_load_round_trips_enabled_predictions() {
        let device = Device::Cpu;
        let weights = test_weights(&device);
        let network =
            LoraNetwork::attach(2, 1.0, &weights, DEFAULT_TARGET_MODULES, &device, DType::F32)
                .unwrap();

        // Give the up matrices non-zero values so ENABLED differs from base.
        for adapter in network.adapters.values() {
            let bump = Tensor::randn(0.0f32, 0.5, adapter.up.dims(), &device).unwrap();
            adapter.up.set(&bump).unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter_last.safetensors");
        network.save(&path, DType::F32).unwrap();

        let restored =
            LoraNetwork::attach(2, 1.0, &weights, DEFAULT_TARGET_MODULES, &device, DType::F32)
                .unwrap();
        restored.load_weights(&path, &device).unwrap();

        let input = Tensor::randn(0.0f32, 1.0, (3, 8), &device).unwrap();
        let key = "down_blocks.0.attn1.to_v";
        let weight = &weights[&format!("{key}.weight")];

        let _a = network.activate().unwrap();
        let original = network.apply(key, &input, weight, None).unwrap();
        drop(_a);
        let _b = restored.activate().unwrap();
        let reloaded = restored.apply(key, &input, weight, None).unwrap();

        let diff = (original - reloaded)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }
}
