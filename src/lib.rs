pub mod loaders;
pub mod models;
pub mod tracking;
pub mod trainers;

// Re-export common types
pub use models::lora::LoraNetwork;
pub use trainers::concept_trainer::{ConceptTrainer, TrainReport};
pub use trainers::{resolve_dtype, TrainingConfig};

pub mod core {
    use anyhow::Result;
    use candle_core::Tensor;

    use crate::models::lora::LoraNetwork;

    /// Noise-prediction interface the training loop drives. The adapter
    /// network is threaded through every call so the model consults it at
    /// its designated target layers.
    pub trait DenoisingModel {
        fn predict(
            &self,
            latents: &Tensor,
            timestep: &Tensor,
            encoder_hidden_states: &Tensor,
            lora: &LoraNetwork,
        ) -> Result<Tensor>;
    }
}

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .init();
    }
}
