pub mod lora;
pub mod unet;

pub use lora::{ActivationScope, LoraNetwork};
pub use unet::{UNet, UNetConfig};
