//! Noise scheduler for the erasure training loop
//!
//! One scheduler serves both discretization regimes the loop needs: the
//! short schedule that controls how far to denoise, and the full 1000-step
//! schedule used to query noise at the matching physical timestep.
//! `set_timesteps` switches between them mid-run.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use log::warn;

pub const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;

/// Named discretization variants. Unrecognized names fall back to LMS,
/// the historical default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerVariant {
    Lms,
    Ddim,
    Ddpm,
    EulerAncestral,
}

impl SchedulerVariant {
    pub fn from_name(name: &str) -> Self {
        match name {
            "lms" => Self::Lms,
            "ddim" => Self::Ddim,
            "ddpm" => Self::Ddpm,
            "euler_a" => Self::EulerAncestral,
            other => {
                warn!("Unknown scheduler '{}', falling back to lms", other);
                Self::Lms
            }
        }
    }

    /// Variants that work in sigma space and need model-input scaling.
    fn is_sigma_space(self) -> bool {
        matches!(self, Self::Lms | Self::EulerAncestral)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

pub struct NoiseScheduler {
    variant: SchedulerVariant,
    prediction: PredictionType,
    alphas_cumprod: Vec<f64>,
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    num_inference_steps: usize,
    lms_derivatives: Vec<Tensor>,
}

impl NoiseScheduler {
    pub fn new(variant: SchedulerVariant, prediction: PredictionType) -> Self {
        // Scaled-linear betas, the SD training schedule.
        let start = BETA_START.sqrt();
        let end = BETA_END.sqrt();
        let betas: Vec<f64> = (0..TRAIN_TIMESTEPS)
            .map(|i| {
                let b = start + (end - start) * (i as f64) / (TRAIN_TIMESTEPS as f64 - 1.0);
                b * b
            })
            .collect();

        let mut alphas_cumprod = Vec::with_capacity(TRAIN_TIMESTEPS);
        let mut cumprod = 1.0;
        for beta in betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }

        let mut scheduler = Self {
            variant,
            prediction,
            alphas_cumprod,
            timesteps: Vec::new(),
            sigmas: Vec::new(),
            num_inference_steps: 0,
            lms_derivatives: Vec::new(),
        };
        scheduler.set_timesteps(TRAIN_TIMESTEPS);
        scheduler
    }

    /// Reconfigure the discretization. Callable mid-run; clears any
    /// multistep history.
    pub fn set_timesteps(&mut self, num_inference_steps: usize) {
        let step_ratio = TRAIN_TIMESTEPS / num_inference_steps;
        self.timesteps = (0..num_inference_steps)
            .map(|i| (num_inference_steps - 1 - i) * step_ratio)
            .collect();

        self.sigmas = self
            .timesteps
            .iter()
            .map(|&t| self.sigma_for(t))
            .chain(std::iter::once(0.0))
            .collect();

        self.num_inference_steps = num_inference_steps;
        self.lms_derivatives.clear();
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn num_inference_steps(&self) -> usize {
        self.num_inference_steps
    }

    pub fn variant(&self) -> SchedulerVariant {
        self.variant
    }

    fn sigma_for(&self, timestep: usize) -> f64 {
        let acp = self.alphas_cumprod[timestep];
        ((1.0 - acp) / acp).sqrt()
    }

    fn step_index(&self, timestep: usize) -> Result<usize> {
        self.timesteps
            .iter()
            .position(|&t| t == timestep)
            .ok_or_else(|| anyhow!("timestep {timestep} is not on the current schedule"))
    }

    pub fn init_noise_sigma(&self) -> f64 {
        if self.variant.is_sigma_space() {
            self.sigmas[0]
        } else {
            1.0
        }
    }

    /// Fresh random latent scaled for the current schedule.
    pub fn initial_latents(
        &self,
        batch_size: usize,
        resolution: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let shape = (batch_size, 4, resolution / 8, resolution / 8);
        let latents = Tensor::randn(0.0f32, 1.0, shape, device)?.to_dtype(dtype)?;
        Ok((latents * self.init_noise_sigma())?)
    }

    /// Sigma-space variants expect the model input divided down to unit
    /// variance; the others pass through.
    pub fn scale_model_input(&self, sample: &Tensor, timestep: usize) -> Result<Tensor> {
        if !self.variant.is_sigma_space() {
            return Ok(sample.clone());
        }
        let sigma = self.sigma_for(timestep);
        Ok((sample / (sigma * sigma + 1.0).sqrt())?)
    }

    /// Predicted clean sample for the configured parameterization.
    fn to_original_sample(
        &self,
        model_output: &Tensor,
        sample: &Tensor,
        timestep: usize,
    ) -> Result<Tensor> {
        let acp = self.alphas_cumprod[timestep];
        match self.prediction {
            PredictionType::Epsilon => {
                Ok(((sample - (model_output * (1.0 - acp).sqrt())?)? / acp.sqrt())?)
            }
            PredictionType::VPrediction => {
                Ok(((sample * acp.sqrt())? - (model_output * (1.0 - acp).sqrt())?)?)
            }
        }
    }

    /// One reverse-diffusion step. `sample` is the current latent at
    /// `timestep` (already on the current schedule).
    pub fn step(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        match self.variant {
            SchedulerVariant::Ddim => self.step_ddim(model_output, timestep, sample),
            SchedulerVariant::Ddpm => self.step_ddpm(model_output, timestep, sample),
            SchedulerVariant::EulerAncestral => self.step_euler_a(model_output, timestep, sample),
            SchedulerVariant::Lms => self.step_lms(model_output, timestep, sample),
        }
    }

    fn prev_alpha_cumprod(&self, timestep: usize) -> f64 {
        let step_ratio = TRAIN_TIMESTEPS / self.num_inference_steps;
        if timestep >= step_ratio {
            self.alphas_cumprod[timestep - step_ratio]
        } else {
            1.0
        }
    }

    fn step_ddim(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_prev = self.prev_alpha_cumprod(timestep);

        let pred_original = self.to_original_sample(model_output, sample, timestep)?;

        // Recompute epsilon from x0 so the same path serves both
        // parameterizations.
        let epsilon =
            ((sample - (&pred_original * alpha_prod_t.sqrt())?)? / (1.0 - alpha_prod_t).sqrt())?;

        let direction = (epsilon * (1.0 - alpha_prod_prev).sqrt())?;
        Ok(((pred_original * alpha_prod_prev.sqrt())? + direction)?)
    }

    fn step_ddpm(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_prev = self.prev_alpha_cumprod(timestep);
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let pred_original = self.to_original_sample(model_output, sample, timestep)?;

        // Posterior mean over (x0, x_t).
        let coef_original = alpha_prod_prev.sqrt() * current_beta / (1.0 - alpha_prod_t);
        let coef_current = current_alpha.sqrt() * (1.0 - alpha_prod_prev) / (1.0 - alpha_prod_t);
        let mean = ((pred_original * coef_original)? + (sample * coef_current)?)?;

        if timestep == 0 {
            return Ok(mean);
        }

        let variance =
            ((1.0 - alpha_prod_prev) / (1.0 - alpha_prod_t) * current_beta).max(1e-20);
        let noise = sample.randn_like(0.0, 1.0)?;
        Ok((mean + (noise * variance.sqrt())?)?)
    }

    fn step_euler_a(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        let i = self.step_index(timestep)?;
        let sigma = self.sigmas[i];
        let sigma_next = self.sigmas[i + 1];

        let pred_original = self.original_from_sigma(model_output, sample, sigma)?;

        let sigma_up = if sigma_next > 0.0 {
            (sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2)).sqrt()
        } else {
            0.0
        };
        let sigma_down = (sigma_next.powi(2) - sigma_up.powi(2)).max(0.0).sqrt();

        let derivative = ((sample - pred_original)? / sigma)?;
        let mut prev = (sample + (derivative * (sigma_down - sigma))?)?;
        if sigma_up > 0.0 {
            let noise = sample.randn_like(0.0, 1.0)?;
            prev = (prev + (noise * sigma_up)?)?;
        }
        Ok(prev)
    }

    fn step_lms(&mut self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Result<Tensor> {
        const LMS_ORDER: usize = 4;

        let i = self.step_index(timestep)?;
        let sigma = self.sigmas[i];

        let pred_original = self.original_from_sigma(model_output, sample, sigma)?;
        let derivative = ((sample - pred_original)? / sigma)?;

        self.lms_derivatives.push(derivative);
        if self.lms_derivatives.len() > LMS_ORDER {
            self.lms_derivatives.remove(0);
        }

        let order = self.lms_derivatives.len();
        let mut prev = sample.clone();
        for (j, derivative) in self.lms_derivatives.iter().rev().enumerate() {
            let coeff = self.lms_coefficient(order, i, j);
            prev = (prev + (derivative * coeff)?)?;
        }
        Ok(prev)
    }

    /// Clean-sample prediction in sigma space, where the latent is
    /// x0 + sigma * eps.
    fn original_from_sigma(&self, model_output: &Tensor, sample: &Tensor, sigma: f64) -> Result<Tensor> {
        match self.prediction {
            PredictionType::Epsilon => Ok((sample - (model_output * sigma)?)?),
            PredictionType::VPrediction => {
                let denom = sigma * sigma + 1.0;
                Ok(((sample / denom)? - (model_output * (sigma / denom.sqrt()))?)?)
            }
        }
    }

    /// Integrated Lagrange-basis coefficient for the linear multistep
    /// update, evaluated by trapezoid rule over [sigma_i, sigma_{i+1}].
    fn lms_coefficient(&self, order: usize, i: usize, j: usize) -> f64 {
        const STEPS: usize = 100;
        let basis = |tau: f64| -> f64 {
            let mut prod = 1.0;
            for k in 0..order {
                if k == j {
                    continue;
                }
                prod *= (tau - self.sigmas[i - k]) / (self.sigmas[i - j] - self.sigmas[i - k]);
            }
            prod
        };

        let a = self.sigmas[i];
        let b = self.sigmas[i + 1];
        let h = (b - a) / STEPS as f64;
        let mut total = (basis(a) + basis(b)) / 2.0;
        for s in 1..STEPS {
            total += basis(a + h * s as f64);
        }
        total * h
    }
}

/// Map a coarse schedule index onto the fine schedule's index space. Both
/// must address the same physical point in the diffusion process.
pub fn rescale_timestep_index(coarse_index: usize, coarse_steps: usize, fine_steps: usize) -> usize {
    let fine = (coarse_index as f64 * fine_steps as f64 / coarse_steps as f64).round() as usize;
    fine.min(fine_steps - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_variant_falls_back_to_lms() {
        assert_eq!(SchedulerVariant::from_name("dpm++"), SchedulerVariant::Lms);
        assert_eq!(SchedulerVariant::from_name("ddim"), SchedulerVariant::Ddim);
        assert_eq!(
            SchedulerVariant::from_name("euler_a"),
            SchedulerVariant::EulerAncestral
        );
    }

    #[test]
    fn set_timesteps_switches_regimes() {
        let mut scheduler =
            NoiseScheduler::new(SchedulerVariant::Ddim, PredictionType::Epsilon);
        assert_eq!(scheduler.variant(), SchedulerVariant::Ddim);

        scheduler.set_timesteps(50);
        assert_eq!(scheduler.num_inference_steps(), 50);
        assert_eq!(scheduler.timesteps().len(), 50);
        assert_eq!(scheduler.timesteps()[0], 980);
        assert_eq!(scheduler.timesteps()[49], 0);

        scheduler.set_timesteps(1000);
        assert_eq!(scheduler.num_inference_steps(), 1000);
        assert_eq!(scheduler.timesteps().len(), 1000);
        assert_eq!(scheduler.timesteps()[0], 999);
    }

    #[test]
    fn rescale_maps_coarse_onto_fine() {
        for coarse_index in 1..=48 {
            let fine = rescale_timestep_index(coarse_index, 50, 1000);
            assert_eq!(fine, coarse_index * 20);
            assert!(fine < 1000);
        }
        // Clamped at the top of the range.
        assert_eq!(rescale_timestep_index(50, 50, 1000), 999);
    }

    #[test]
    fn ddim_step_moves_toward_clean_sample() {
        let device = Device::Cpu;
        let mut scheduler =
            NoiseScheduler::new(SchedulerVariant::Ddim, PredictionType::Epsilon);
        scheduler.set_timesteps(50);

        let sample = Tensor::randn(0.0f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        // Zero predicted noise: x0 = sample / sqrt(acp), step stays finite.
        let eps = sample.zeros_like().unwrap();
        let prev = scheduler.step(&eps, 980, &sample).unwrap();
        assert_eq!(prev.dims(), sample.dims());

        let max = prev.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max.is_finite());
    }

    #[test]
    fn lms_history_resets_with_schedule() {
        let device = Device::Cpu;
        let mut scheduler =
            NoiseScheduler::new(SchedulerVariant::Lms, PredictionType::Epsilon);
        scheduler.set_timesteps(50);

        let sample = Tensor::randn(0.0f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        let eps = Tensor::randn(0.0f32, 0.1, (1, 4, 8, 8), &device).unwrap();
        scheduler.step(&eps, 980, &sample).unwrap();
        scheduler.step(&eps, 960, &sample).unwrap();
        assert_eq!(scheduler.lms_derivatives.len(), 2);

        scheduler.set_timesteps(1000);
        assert!(scheduler.lms_derivatives.is_empty());
    }

    #[test]
    fn sigma_scaling_only_for_sigma_space_variants() {
        let device = Device::Cpu;
        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &device).unwrap();

        let mut ddim = NoiseScheduler::new(SchedulerVariant::Ddim, PredictionType::Epsilon);
        ddim.set_timesteps(50);
        let scaled = ddim.scale_model_input(&sample, 980).unwrap();
        assert_eq!(scaled.max_all().unwrap().to_scalar::<f32>().unwrap(), 1.0);

        let mut lms = NoiseScheduler::new(SchedulerVariant::Lms, PredictionType::Epsilon);
        lms.set_timesteps(50);
        let scaled = lms.scale_model_input(&sample, 980).unwrap();
        assert!(scaled.max_all().unwrap().to_scalar::<f32>().unwrap() < 1.0);
    }
}
