pub mod concept_trainer;
pub mod diffusion;
pub mod scheduler;
pub mod text_encoder;

// Re-export key types
pub use concept_trainer::{ConceptTrainer, TrainReport};
pub use scheduler::{NoiseScheduler, PredictionType, SchedulerVariant};
pub use text_encoder::PromptEncoder;

use candle_core::DType;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Full configuration for one erasure training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Concept to erase (or emphasize, with negative guidance).
    pub prompt: String,
    pub neutral_prompt: String,
    pub pretrained_model: PathBuf,
    pub rank: usize,
    pub alpha: f32,
    pub iterations: usize,
    pub negative_guidance: f64,
    pub lr: f64,
    pub save_path: PathBuf,
    pub v2: bool,
    pub v_pred: bool,
    pub precision: String,
    pub scheduler_name: String,
    pub resolution: usize,
    pub track: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            neutral_prompt: String::new(),
            pretrained_model: PathBuf::new(),
            rank: 4,
            alpha: 1.0,
            iterations: 1000,
            negative_guidance: 1.0,
            lr: 1e-5,
            save_path: PathBuf::from("./output"),
            v2: false,
            v_pred: false,
            precision: "float16".to_string(),
            scheduler_name: "lms".to_string(),
            resolution: 512,
            track: false,
        }
    }
}

/// Resolve the working precision. Three names are recognized; anything
/// else (including "mixed" spellings) falls back to full precision.
pub fn resolve_dtype(precision: &str) -> DType {
    match precision {
        "float32" => DType::F32,
        "float16" => DType::F16,
        "bfloat16" => DType::BF16,
        other => {
            warn!("Unknown precision '{}', falling back to float32", other);
            DType::F32
        }
    }
}

/// File-name-safe form of the concept prompt.
pub fn concept_file_name(prompt: &str) -> String {
    let sanitized: String = prompt
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            c => c,
        })
        .collect();
    format!("{sanitized}_last.safetensors")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_precisions_resolve() {
        assert_eq!(resolve_dtype("float32"), DType::F32);
        assert_eq!(resolve_dtype("float16"), DType::F16);
        assert_eq!(resolve_dtype("bfloat16"), DType::BF16);
    }

    #[test]
    fn unknown_precision_falls_back_to_f32() {
        assert_eq!(resolve_dtype("int8"), DType::F32);
        assert_eq!(resolve_dtype("mixed"), DType::F32);
        assert_eq!(resolve_dtype(""), DType::F32);
    }

    #[test]
    fn concept_name_is_path_safe() {
        assert_eq!(
            concept_file_name("van gogh style"),
            "van_gogh_style_last.safetensors"
        );
        assert_eq!(concept_file_name("a/b"), "a_b_last.safetensors");
    }
}
